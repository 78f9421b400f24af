//! Capture helper for AMR utility-meter reception via rtlamr.
//!
//! Drives an `rtlamr` subprocess in JSON output mode and forwards every
//! meter reading to the host as a data report. The source definition
//! names the helper (`rtlamr` or `rtlamr-<n>`) and may carry `channel`
//! (center frequency in raw Hz), `filterid`, `msgtype` and `server`
//! options. Each output line is checked to be a JSON document before
//! forwarding; a line that isn't ends the session with an error report.

use std::{
    process::Stdio,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use clap::Parser;
use color_eyre::eyre::Error;
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

const DRIVER: &str = "rtlamr";

/// Link type reported for AMR JSON records.
const DLT_RTLAMR: u32 = 148;

/// Record type tag the host's AMR decoder matches on.
const RECORD_TYPE: &str = "RTLamr";

/// 912.600 MHz, the AMR meter band, in raw Hz.
const DEFAULT_FREQUENCY: &str = "912600000";

#[derive(Debug, Parser)]
struct Args {
    #[clap(flatten)]
    common: CommonArgs,

    /// Path to the rtlamr binary.
    #[clap(long, default_value = "rtlamr")]
    rtlamr_binary: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let source = RtlAmrSource {
        binary: args.rtlamr_binary.clone(),
    };
    run_adapter(DRIVER, &args.common, source).await?;

    Ok(())
}

struct RtlAmrSource {
    binary: String,
}

impl CaptureSource for RtlAmrSource {
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
            channel: Some(frequency_for(options)),
            channels: Some(vec![frequency_for(options)]),
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
            .args(rtlamr_arguments(options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| format!("failed to start {}: {error}", self.binary))?;

        let stdout = child
            .stdout
            .take()
            .ok_or("rtlamr stdout was not captured")?;

        // the relay task owns the child; aborting it on kill reaps the
        // subprocess through kill_on_drop
        let session = handle.clone();
        handle.add_task(tokio::spawn(async move {
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match report_from_line(&line) {
                            Some(report) => session.send_data_report(&report),
                            None => {
                                session
                                    .send_error_report(0, "rtlamr produced non-JSON output");
                                session.spindown();
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        session.send_error_report(0, "rtlamr exited unexpectedly");
                        session.spindown();
                        return;
                    }
                    Err(error) => {
                        session.send_error_report(0, &format!("error reading rtlamr: {error}"));
                        session.spindown();
                        return;
                    }
                }
            }
        }));

        tracing::info!(device, "rtlamr capture started");

        Ok(Some(OpenResult {
            dlt: DLT_RTLAMR,
            capture_interface: Some(format!("rtlamr-{device}")),
            channel: Some(frequency_for(options)),
            hardware: Some("rtl-sdr".to_owned()),
            uuid: Some(device_uuid(device)),
            ..Default::default()
        }))
    }
}

fn device_for(source: &str, options: &SourceOptions) -> Option<u32> {
    let suffix = if source == DRIVER {
        None
    }
    else {
        Some(source.strip_prefix("rtlamr-")?.parse::<u32>().ok()?)
    };

    if let Some(device) = options.get("device") {
        return device.parse().ok();
    }

    Some(suffix.unwrap_or(0))
}

fn frequency_for(options: &SourceOptions) -> String {
    options
        .get("channel")
        .or_else(|| options.get("frequency"))
        .cloned()
        .unwrap_or_else(|| DEFAULT_FREQUENCY.to_owned())
}

fn device_uuid(device: u32) -> String {
    make_uuid(DRIVER, &format!("{device:012}"))
}

fn rtlamr_arguments(options: &SourceOptions) -> Vec<String> {
    let mut arguments = vec![
        "-format=json".to_owned(),
        format!("-centerfreq={}", frequency_for(options)),
    ];

    if let Some(filterid) = options.get("filterid") {
        arguments.push(format!("-filterid={filterid}"));
    }
    if let Some(msgtype) = options.get("msgtype") {
        arguments.push(format!("-msgtype={msgtype}"));
    }
    if let Some(server) = options.get("server") {
        arguments.push(format!("-server={server}"));
    }

    arguments
}

/// Validates one output line as JSON and wraps it into a data report.
/// `None` means the line isn't a JSON document.
fn report_from_line(line: &str) -> Option<DataReport> {
    serde_json::from_str::<serde_json::Value>(line).ok()?;

    let (time_sec, time_usec) = timestamp();
    Some(DataReport {
        json: Some(JsonRecord {
            record_type: RECORD_TYPE.to_owned(),
            json: line.to_owned(),
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
