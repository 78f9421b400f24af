//! Capture helper for ADS-B reception via rtl_adsb.
//!
//! Reads raw Mode-S frames from an `rtl_adsb` subprocess, validates their
//! CRC (repairing single-bit errors on extended squitters), decodes the
//! fields of interest and forwards each frame to the host as a JSON data
//! report.

use std::{
    process::Stdio,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use clap::Parser;
use color_eyre::eyre::Error;
use serde::Serialize;
use tokio::{
    io::{
        AsyncBufReadExt,
        BufReader,
    },
    process::Command,
};
use wavecap_datasource::{
    CallbackResult,
    CaptureSource,
    CommonArgs,
    DatasourceHandle,
    OpenResult,
    ProbeResult,
    SourceOptions,
    make_uuid,
    run_adapter,
};
use wavecap_proto::messages::{
    DataReport,
    JsonRecord,
};

mod mode_s;

const DRIVER: &str = "rtladsb";

/// Link type reported for ADS-B JSON records.
const DLT_ADSB: u32 = 146;

const CHANNEL: &str = "1090MHz";

#[derive(Debug, Parser)]
struct Args {
    #[clap(flatten)]
    common: CommonArgs,

    /// Path to the rtl_adsb binary.
    #[clap(long, default_value = "rtl_adsb")]
    rtladsb_binary: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let source = RtlAdsbSource {
        binary: args.rtladsb_binary.clone(),
    };
    run_adapter(DRIVER, &args.common, source).await?;

    Ok(())
}

struct RtlAdsbSource {
    binary: String,
}

impl CaptureSource for RtlAdsbSource {
    fn probe_source(
        &mut self,
        source: &str,
        options: &SourceOptions,
    ) -> CallbackResult<Option<ProbeResult>> {
        let Some(device) = device_for(source, options)
        else {
            return Ok(None);
        };

        Ok(Some(ProbeResult {
            channel: Some(CHANNEL.to_owned()),
            channels: Some(vec![CHANNEL.to_owned()]),
            hardware: Some("rtl-sdr".to_owned()),
            uuid: Some(device_uuid(device)),
        }))
    }

    fn open_source(
        &mut self,
        handle: &DatasourceHandle,
        source: &str,
        options: &SourceOptions,
    ) -> CallbackResult<Option<OpenResult>> {
        let Some(device) = device_for(source, options)
        else {
            return Ok(None);
        };

        let mut child = Command::new(&self.binary)
            .args(rtladsb_arguments(device, options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| format!("failed to start {}: {error}", self.binary))?;

        let stdout = child
            .stdout
            .take()
            .ok_or("rtl_adsb stdout was not captured")?;

        // the relay task owns the child; aborting it on kill reaps the
        // subprocess through kill_on_drop
        let session = handle.clone();
        handle.add_task(tokio::spawn(async move {
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(report) = report_from_line(&line) {
                            session.send_data_report(&report);
                        }
                    }
                    Ok(None) => {
                        session.send_error_report(0, "rtl_adsb exited unexpectedly");
                        session.spindown();
                        return;
                    }
                    Err(error) => {
                        session.send_error_report(0, &format!("error reading rtl_adsb: {error}"));
                        session.spindown();
                        return;
                    }
                }
            }
        }));

        tracing::info!(device, "rtl_adsb capture started");

        Ok(Some(OpenResult {
            dlt: DLT_ADSB,
            capture_interface: Some(format!("rtladsb-{device}")),
            channel: Some(CHANNEL.to_owned()),
            hardware: Some("rtl-sdr".to_owned()),
            uuid: Some(device_uuid(device)),
            ..Default::default()
        }))
    }
}

/// The fields forwarded for one validated frame.
#[derive(Debug, Serialize)]
struct AdsbRecord {
    /// Raw frame as uppercase hex.
    raw: String,
    df: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    icao: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    callsign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    altitude_ft: Option<i32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    repaired: bool,
}

fn device_for(source: &str, options: &SourceOptions) -> Option<u32> {
    let suffix = if source == DRIVER {
        None
    }
    else {
        Some(source.strip_prefix("rtladsb-")?.parse::<u32>().ok()?)
    };

    if let Some(device) = options.get("device") {
        return device.parse().ok();
    }

    Some(suffix.unwrap_or(0))
}

fn device_uuid(device: u32) -> String {
    make_uuid(DRIVER, &format!("{device:012}"))
}

fn rtladsb_arguments(device: u32, options: &SourceOptions) -> Vec<String> {
    let mut arguments = vec!["-d".to_owned(), device.to_string()];

    if let Some(gain) = options.get("gain") {
        arguments.push("-g".to_owned());
        arguments.push(gain.clone());
    }
    if let Some(ppm) = options.get("ppm") {
        arguments.push("-p".to_owned());
        arguments.push(ppm.clone());
    }

    arguments
}

/// Parses one `*<hex>;` output line into a frame.
fn parse_line(line: &str) -> Option<Vec<u8>> {
    let hex = line.trim().strip_prefix('*')?.strip_suffix(';')?;
    let frame = hex::decode(hex).ok()?;
    matches!(
        frame.len(),
        mode_s::SHORT_FRAME_LENGTH | mode_s::LONG_FRAME_LENGTH
    )
    .then_some(frame)
}

/// Validates and decodes one output line into a data report. Frames that
/// fail CRC validation and cannot be repaired are dropped.
fn report_from_line(line: &str) -> Option<DataReport> {
    let mut frame = parse_line(line)?;

    let mut repaired = false;
    if mode_s::icao(&frame).is_some() && !mode_s::verify(&frame) {
        if !mode_s::repair(&mut frame) {
            tracing::trace!(line, "dropping frame with unrecoverable crc");
            return None;
        }
        repaired = true;
    }

    let record = AdsbRecord {
        raw: hex::encode_upper(&frame),
        df: mode_s::downlink_format(&frame),
        icao: mode_s::icao(&frame).map(hex::encode_upper),
        callsign: mode_s::callsign(&frame),
        altitude_ft: mode_s::altitude_ft(&frame),
        repaired,
    };

    let (time_sec, time_usec) = timestamp();
    Some(DataReport {
        json: Some(JsonRecord {
            record_type: "adsb".to_owned(),
            json: serde_json::to_string(&record).ok()?,
            time_sec,
            time_usec,
        }),
        ..Default::default()
    })
}

fn timestamp() -> (u64, u32) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => (elapsed.as_secs(), elapsed.subsec_micros()),
        Err(_) => (0, 0),
    }
}

#[cfg(test)]
mod tests {
    use wavecap_datasource::SourceOptions;

    use super::{
        device_for,
        parse_line,
        report_from_line,
        rtladsb_arguments,
    };

    const IDENT_LINE: &str = "*8D4840D6202CC371C32CE0576098;";

    #[test]
    fn lines_parse_to_frames() {
        assert_eq!(parse_line(IDENT_LINE).unwrap().len(), 14);
        assert!(parse_line("*8D4840D6;").is_none());
        assert!(parse_line("not a frame").is_none());
        assert!(parse_line("*nothexatall02;").is_none());
    }

    #[test]
    fn valid_frames_become_reports() {
        let report = report_from_line(IDENT_LINE).unwrap();
        let record = report.json.unwrap();
        assert_eq!(record.record_type, "adsb");
        assert!(record.json.contains(r#""callsign":"KLM1023""#));
        assert!(record.json.contains(r#""icao":"4840D6""#));
        assert!(!record.json.contains("repaired"));
    }

    #[test]
    fn corrupted_frames_are_repaired_and_marked() {
        // bit flipped in the callsign field
        let report = report_from_line("*8D4840D6202CC371C12CE0576098;").unwrap();
        let record = report.json.unwrap();
        assert!(record.json.contains(r#""callsign":"KLM1023""#));
        assert!(record.json.contains(r#""repaired":true"#));
    }

    #[test]
    fn garbage_frames_are_dropped() {
        // two separate bit flips, unrecoverable
        assert!(report_from_line("*8D4840D6202CC371C12CE0576099;").is_none());
    }

    #[test]
    fn device_resolution() {
        assert_eq!(device_for("rtladsb", &SourceOptions::new()), Some(0));
        assert_eq!(device_for("rtladsb-1", &SourceOptions::new()), Some(1));
        assert_eq!(device_for("rtl433", &SourceOptions::new()), None);
    }

    #[test]
    fn tuning_options_become_arguments() {
        let mut options = SourceOptions::new();
        options.insert("gain".to_owned(), "49.6".to_owned());
        assert_eq!(rtladsb_arguments(0, &options), vec!["-d", "0", "-g", "49.6"]);
    }
}
