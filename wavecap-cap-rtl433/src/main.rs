//! Capture helper for rtl_433-compatible receivers.
//!
//! Drives an `rtl_433` subprocess in JSON output mode and forwards every
//! decoded record to the host as a data report. The source definition
//! names the helper (`rtl433` or `rtl433-<n>`) and may carry `device`,
//! `channel`, `gain` and `ppm` options.

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

const DRIVER: &str = "rtl433";

/// Link type reported for rtl_433 JSON records.
const DLT_RTL433: u32 = 147;

const DEFAULT_FREQUENCY: &str = "433.920MHz";

#[derive(Debug, Parser)]
struct Args {
    #[clap(flatten)]
    common: CommonArgs,

    /// Path to the rtl_433 binary.
    #[clap(long, default_value = "rtl_433")]
    rtl433_binary: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let source = Rtl433Source {
        binary: args.rtl433_binary.clone(),
    };
    run_adapter(DRIVER, &args.common, source).await?;

    Ok(())
}

struct Rtl433Source {
    binary: String,
}

impl CaptureSource for Rtl433Source {
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
            uuid: Some(device_uuid(&device)),
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
            .args(rtl433_arguments(&device, options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| format!("failed to start {}: {error}", self.binary))?;

        let stdout = child
            .stdout
            .take()
            .ok_or("rtl_433 stdout was not captured")?;

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
                        let (time_sec, time_usec) = timestamp();
                        session.send_data_report(&DataReport {
                            json: Some(JsonRecord {
                                record_type: DRIVER.to_owned(),
                                json: line,
                                time_sec,
                                time_usec,
                            }),
                            ..Default::default()
                        });
                    }
                    Ok(None) => {
                        session.send_error_report(0, "rtl_433 exited unexpectedly");
                        session.spindown();
                        return;
                    }
                    Err(error) => {
                        session.send_error_report(0, &format!("error reading rtl_433: {error}"));
                        session.spindown();
                        return;
                    }
                }
            }
        }));

        tracing::info!(%device, "rtl_433 capture started");

        Ok(Some(OpenResult {
            dlt: DLT_RTL433,
            capture_interface: Some(format!("rtl433-{device}")),
            channel: Some(frequency_for(options)),
            hardware: Some("rtl-sdr".to_owned()),
            uuid: Some(device_uuid(&device)),
            ..Default::default()
        }))
    }
}

/// Resolves the device selector (an index or a serial, passed verbatim to
/// `rtl_433 -d`) from the source name or the `device` option. `None` means
/// the source doesn't belong to this helper.
fn device_for(source: &str, options: &SourceOptions) -> Option<String> {
    let suffix = if source == DRIVER {
        None
    }
    else {
        Some(source.strip_prefix("rtl433-")?.parse::<u32>().ok()?)
    };

    if let Some(device) = options.get("device") {
        return Some(device.clone());
    }

    Some(suffix.unwrap_or(0).to_string())
}

fn frequency_for(options: &SourceOptions) -> String {
    options
        .get("channel")
        .or_else(|| options.get("frequency"))
        .cloned()
        .unwrap_or_else(|| DEFAULT_FREQUENCY.to_owned())
}

fn device_uuid(device: &str) -> String {
    make_uuid(DRIVER, &format!("{device:0>12}"))
}

fn rtl433_arguments(device: &str, options: &SourceOptions) -> Vec<String> {
    let mut arguments = vec![
        "-d".to_owned(),
        device.to_owned(),
        "-f".to_owned(),
        frequency_for(options),
        "-F".to_owned(),
        "json".to_owned(),
    ];

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
        frequency_for,
        rtl433_arguments,
    };

    fn options(pairs: &[(&str, &str)]) -> SourceOptions {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn bare_name_is_device_zero() {
        assert_eq!(
            device_for("rtl433", &SourceOptions::new()),
            Some("0".to_owned())
        );
    }

    #[test]
    fn numbered_name_selects_the_device() {
        assert_eq!(
            device_for("rtl433-2", &SourceOptions::new()),
            Some("2".to_owned())
        );
    }

    #[test]
    fn device_option_wins_over_name_suffix() {
        // serials are passed through verbatim
        assert_eq!(
            device_for("rtl433-2", &options(&[("device", ":serial42")])),
            Some(":serial42".to_owned())
        );
    }

    #[test]
    fn foreign_names_are_rejected() {
        assert_eq!(device_for("wifi0", &SourceOptions::new()), None);
        assert_eq!(device_for("rtl433-x", &SourceOptions::new()), None);
    }

    #[test]
    fn default_frequency_applies() {
        assert_eq!(frequency_for(&SourceOptions::new()), "433.920MHz");
        assert_eq!(
            frequency_for(&options(&[("channel", "868.3MHz")])),
            "868.3MHz"
        );
    }

    #[test]
    fn tuning_options_become_arguments() {
        let arguments = rtl433_arguments("1", &options(&[("gain", "40"), ("ppm", "2")]));
        assert_eq!(
            arguments,
            vec!["-d", "1", "-f", "433.920MHz", "-F", "json", "-g", "40", "-p", "2"]
        );
    }
}
