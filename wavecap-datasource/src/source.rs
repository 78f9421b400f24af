//! The datasource layer: capture callbacks bound to an engine.
//!
//! A [`Datasource`] wraps an engine and registers handlers for the four
//! capture commands. Adapters implement [`CaptureSource`] and never touch
//! the wire themselves; every request produces exactly one report, even
//! when the callback fails.
//!
//! Interface listing and probing are one-shot queries, so their handlers
//! spin the engine down after the report. Opening and configuring keep the
//! session running.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use wavecap_external::{
    engine::{
        Engine,
        EngineError,
        ExternalHandle,
    },
    transport::Transport,
};
use wavecap_proto::{
    command,
    messages::{
        ChannelHop,
        Configure,
        ConfigureReport,
        DataReport,
        ErrorReport,
        Interface,
        InterfacesReport,
        MessageType,
        MsgbusMessage,
        NewSource,
        OpenSource,
        OpenSourceReport,
        ProbeSource,
        ProbeSourceReport,
        Success,
        WarningReport,
    },
};

use crate::definition::{
    SourceOptions,
    parse_definition,
};

/// Result type for [`CaptureSource`] callbacks. Errors are caught by the
/// handler and turned into a failure report carrying the error text.
pub type CallbackResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// What a successful probe found out about a source.
#[derive(Clone, Debug, Default)]
pub struct ProbeResult {
    pub channel: Option<String>,
    pub channels: Option<Vec<String>>,
    pub hardware: Option<String>,
    pub uuid: Option<String>,
}

/// What opening a source established.
#[derive(Clone, Debug, Default)]
pub struct OpenResult {
    /// DLT/link type of packets this source emits.
    pub dlt: u32,
    pub capture_interface: Option<String>,
    pub channel: Option<String>,
    pub channels: Option<Vec<String>>,
    pub hardware: Option<String>,
    pub uuid: Option<String>,
    pub warning: Option<String>,
}

/// Outcome of a configuration change.
#[derive(Clone, Debug, Default)]
pub struct ConfigureResult {
    pub channel: Option<String>,
    pub hopping: Option<ChannelHop>,
    pub warning: Option<String>,
}

/// Capture callbacks an adapter implements.
///
/// Every method defaults to `Ok(None)`, meaning the operation is not
/// supported by this adapter; the handler reports that as a failure.
/// Returning `Err` also produces a failure report, with the error text as
/// the message.
pub trait CaptureSource {
    /// Enumerates interfaces this helper can drive. `Ok(None)` here means
    /// enumeration isn't supported, which is reported as an empty success.
    fn list_interfaces(&mut self) -> CallbackResult<Option<Vec<Interface>>> {
        Ok(None)
    }

    /// Decides whether `source` belongs to this helper.
    fn probe_source(
        &mut self,
        source: &str,
        options: &SourceOptions,
    ) -> CallbackResult<Option<ProbeResult>> {
        let _ = (source, options);
        Ok(None)
    }

    /// Opens `source` and starts capturing. The handle stays valid for the
    /// whole session; background tasks report data through it.
    fn open_source(
        &mut self,
        handle: &DatasourceHandle,
        source: &str,
        options: &SourceOptions,
    ) -> CallbackResult<Option<OpenResult>> {
        let _ = (handle, source, options);
        Ok(None)
    }

    /// Applies a configuration change to the open source.
    fn configure_source(
        &mut self,
        seqno: u32,
        config: &Configure,
    ) -> CallbackResult<Option<ConfigureResult>> {
        let _ = (seqno, config);
        Ok(None)
    }
}

/// Clonable handle adapters use to emit reports and manage lifecycle.
#[derive(Clone)]
pub struct DatasourceHandle {
    external: ExternalHandle,
}

impl DatasourceHandle {
    fn new(external: ExternalHandle) -> Self {
        Self { external }
    }

    fn send_json(&self, command: &str, report: &impl Serialize) {
        let content = serde_json::to_vec(report).unwrap_or_default();
        if let Err(error) = self.external.send_packet(command, content) {
            tracing::debug!(command, ?error, "failed to queue report");
        }
    }

    /// Streams capture data to the host.
    pub fn send_data_report(&self, report: &DataReport) {
        self.send_json(command::KDS_DATA_REPORT, report);
    }

    /// Reports a fatal source error. `seqno` correlates it with a request,
    /// `0` marks it unsolicited.
    pub fn send_error_report(&self, seqno: u32, message: &str) {
        self.send_json(
            command::KDS_ERROR,
            &ErrorReport {
                success: Success {
                    success: false,
                    seqno,
                },
                message: Some(MsgbusMessage::new(message, MessageType::Error)),
            },
        );
    }

    /// Reports a non-fatal condition shown in the host's source details.
    pub fn send_warning_report(&self, warning: &str) {
        self.send_json(
            command::KDS_WARNING_REPORT,
            &WarningReport {
                warning: warning.to_owned(),
            },
        );
    }

    /// Announces this helper's source to a remote host after connecting.
    pub fn send_newsource(&self, definition: &str, sourcetype: &str, uuid: &str) {
        self.send_json(
            command::KDS_NEW_SOURCE,
            &NewSource {
                definition: definition.to_owned(),
                sourcetype: sourcetype.to_owned(),
                uuid: uuid.to_owned(),
            },
        );
    }

    /// Sends a message for the host's message bus.
    pub fn send_message(&self, text: &str, msgtype: MessageType) {
        self.external.send_message(text, msgtype);
    }

    /// Sends a liveness ping; a missing answer eventually kills the engine.
    pub fn send_ping(&self) {
        self.external.send_ping();
    }

    /// Registers a background task to be aborted when the engine is killed.
    pub fn add_task(&self, task: JoinHandle<()>) {
        self.external.add_task(task);
    }

    /// Registers a callback run during kill, in registration order.
    pub fn add_exit_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.external.add_exit_callback(callback);
    }

    /// Graceful shutdown: queued reports are drained first.
    pub fn spindown(&self) {
        self.external.spindown();
    }

    /// Immediate shutdown, discarding unsent reports.
    pub fn kill(&self) {
        self.external.kill();
    }

    pub fn is_running(&self) -> bool {
        self.external.is_running()
    }
}

/// An engine with the capture command handlers attached.
pub struct Datasource {
    engine: Engine,
}

impl Datasource {
    /// Binds `source` to a new engine over `transport`.
    pub fn new<S>(transport: Transport, source: S) -> Self
    where
        S: CaptureSource + Send + 'static,
    {
        let mut engine = Engine::new(transport);
        register_handlers(&mut engine, Arc::new(Mutex::new(source)));
        Self { engine }
    }

    /// Overrides the engine's liveness window.
    pub fn with_liveness_window(mut self, window: std::time::Duration) -> Self {
        self.engine = self.engine.with_liveness_window(window);
        self
    }

    pub fn handle(&self) -> DatasourceHandle {
        DatasourceHandle::new(self.engine.handle())
    }

    /// Runs the engine to termination.
    pub async fn run(self) -> Result<(), EngineError> {
        self.engine.run().await
    }
}

fn register_handlers<S>(engine: &mut Engine, source: Arc<Mutex<S>>)
where
    S: CaptureSource + Send + 'static,
{
    let list_source = source.clone();
    engine.add_handler(command::KDS_LIST_INTERFACES, move |handle, seqno, _content| {
        let ds = DatasourceHandle::new(handle.clone());
        let report = match list_source.lock().list_interfaces() {
            Ok(interfaces) => {
                InterfacesReport {
                    success: Success {
                        success: true,
                        seqno,
                    },
                    message: None,
                    interfaces: interfaces.unwrap_or_default(),
                }
            }
            Err(error) => {
                InterfacesReport {
                    success: Success {
                        success: false,
                        seqno,
                    },
                    message: Some(MsgbusMessage::new(error.to_string(), MessageType::Error)),
                    interfaces: Vec::new(),
                }
            }
        };
        ds.send_json(command::KDS_INTERFACES_REPORT, &report);
        handle.spindown();
    });

    let probe_source = source.clone();
    engine.add_handler(command::KDS_PROBE_SOURCE, move |handle, seqno, content| {
        let ds = DatasourceHandle::new(handle.clone());
        let report = probe_report(&probe_source, seqno, content);
        ds.send_json(command::KDS_PROBE_SOURCE_REPORT, &report);
        handle.spindown();
    });

    let open_source = source.clone();
    engine.add_handler(command::KDS_OPEN_SOURCE, move |handle, seqno, content| {
        let ds = DatasourceHandle::new(handle.clone());
        let report = open_report(&open_source, &ds, seqno, content);
        ds.send_json(command::KDS_OPEN_SOURCE_REPORT, &report);
    });

    engine.add_handler(command::KDS_CONFIGURE, move |handle, seqno, content| {
        let ds = DatasourceHandle::new(handle.clone());
        let report = configure_report(&source, seqno, content);
        ds.send_json(command::KDS_CONFIGURE_REPORT, &report);
    });
}

fn failure(seqno: u32, message: String) -> (Success, Option<MsgbusMessage>) {
    (
        Success {
            success: false,
            seqno,
        },
        Some(MsgbusMessage::new(message, MessageType::Error)),
    )
}

/// Decodes a probe request and runs the callback. Never fails; every
/// outcome is a report.
fn probe_report<S: CaptureSource>(
    source: &Mutex<S>,
    seqno: u32,
    content: &Bytes,
) -> ProbeSourceReport {
    let empty = |success, message| {
        ProbeSourceReport {
            success,
            message,
            channel: None,
            channels: None,
            hardware: None,
            uuid: None,
        }
    };

    let request: ProbeSource = match serde_json::from_slice(content) {
        Ok(request) => request,
        Err(error) => {
            let (success, message) = failure(seqno, format!("invalid probe request: {error}"));
            return empty(success, message);
        }
    };

    let Some((name, options)) = parse_definition(&request.definition)
    else {
        let (success, message) = failure(
            seqno,
            format!("unable to parse source definition {:?}", request.definition),
        );
        return empty(success, message);
    };

    match source.lock().probe_source(&name, &options) {
        Ok(Some(result)) => {
            ProbeSourceReport {
                success: Success {
                    success: true,
                    seqno,
                },
                message: None,
                channel: result.channel,
                channels: result.channels,
                hardware: result.hardware,
                uuid: result.uuid,
            }
        }
        Ok(None) => {
            let (success, message) =
                failure(seqno, format!("source {name:?} is not handled by this helper"));
            empty(success, message)
        }
        Err(error) => {
            let (success, message) = failure(seqno, error.to_string());
            empty(success, message)
        }
    }
}

fn open_report<S: CaptureSource>(
    source: &Mutex<S>,
    ds: &DatasourceHandle,
    seqno: u32,
    content: &Bytes,
) -> OpenSourceReport {
    let empty = |success, message| {
        OpenSourceReport {
            success,
            message,
            dlt: 0,
            capture_interface: None,
            channel: None,
            channels: None,
            hardware: None,
            uuid: None,
            warning: None,
        }
    };

    let request: OpenSource = match serde_json::from_slice(content) {
        Ok(request) => request,
        Err(error) => {
            let (success, message) = failure(seqno, format!("invalid open request: {error}"));
            return empty(success, message);
        }
    };

    let Some((name, options)) = parse_definition(&request.definition)
    else {
        let (success, message) = failure(
            seqno,
            format!("unable to parse source definition {:?}", request.definition),
        );
        return empty(success, message);
    };

    match source.lock().open_source(ds, &name, &options) {
        Ok(Some(result)) => {
            OpenSourceReport {
                success: Success {
                    success: true,
                    seqno,
                },
                message: None,
                dlt: result.dlt,
                capture_interface: result.capture_interface,
                channel: result.channel,
                channels: result.channels,
                hardware: result.hardware,
                uuid: result.uuid,
                warning: result.warning,
            }
        }
        Ok(None) => {
            let (success, message) =
                failure(seqno, format!("source {name:?} cannot be opened by this helper"));
            empty(success, message)
        }
        Err(error) => {
            let (success, message) = failure(seqno, error.to_string());
            empty(success, message)
        }
    }
}

fn configure_report<S: CaptureSource>(
    source: &Mutex<S>,
    seqno: u32,
    content: &Bytes,
) -> ConfigureReport {
    let empty = |success, message| {
        ConfigureReport {
            success,
            message,
            channel: None,
            hopping: None,
            warning: None,
        }
    };

    let request: Configure = match serde_json::from_slice(content) {
        Ok(request) => request,
        Err(error) => {
            let (success, message) = failure(seqno, format!("invalid configure request: {error}"));
            return empty(success, message);
        }
    };

    match source.lock().configure_source(seqno, &request) {
        Ok(Some(result)) => {
            ConfigureReport {
                success: Success {
                    success: true,
                    seqno,
                },
                message: None,
                channel: result.channel,
                hopping: result.hopping,
                warning: result.warning,
            }
        }
        Ok(None) => {
            let (success, message) =
                failure(seqno, "this source does not support configuration".to_owned());
            empty(success, message)
        }
        Err(error) => {
            let (success, message) = failure(seqno, error.to_string());
            empty(success, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::{
        Buf,
        BytesMut,
    };
    use parking_lot::Mutex;
    use wavecap_external::transport::Transport;
    use wavecap_proto::{
        command,
        envelope::Envelope,
        frame,
        messages::{
            Configure,
            ConfigureReport,
            DataReport,
            InterfacesReport,
            JsonRecord,
            OpenSource,
            OpenSourceReport,
            ProbeSource,
            ProbeSourceReport,
        },
    };

    use super::{
        CallbackResult,
        CaptureSource,
        Datasource,
        DatasourceHandle,
        OpenResult,
        ProbeResult,
    };
    use crate::definition::SourceOptions;

    struct Peer {
        transport: Transport,
        buffer: BytesMut,
    }

    impl Peer {
        fn new(transport: Transport) -> Self {
            Self {
                transport,
                buffer: BytesMut::new(),
            }
        }

        async fn read_envelope(&mut self) -> Envelope {
            loop {
                if let Some(decoded) = frame::try_decode(&self.buffer).unwrap() {
                    self.buffer.advance(decoded.consumed);
                    return Envelope::decode(decoded.payload).unwrap();
                }

                let n = self
                    .transport
                    .read_chunk(&mut self.buffer)
                    .await
                    .unwrap();
                assert_ne!(n, 0, "helper closed the connection");
            }
        }

        async fn send_request(&mut self, command: &str, seqno: u32, request: &impl serde::Serialize) {
            let content = serde_json::to_vec(request).unwrap();
            let payload = Envelope::new(command, seqno, content).encode().unwrap();
            self.transport.send(frame::encode(&payload)).await.unwrap();
        }
    }

    #[derive(Default)]
    struct TestSource {
        probe_error: Option<String>,
        opened: Arc<Mutex<Option<DatasourceHandle>>>,
    }

    impl CaptureSource for TestSource {
        fn probe_source(
            &mut self,
            source: &str,
            options: &SourceOptions,
        ) -> CallbackResult<Option<ProbeResult>> {
            if let Some(error) = &self.probe_error {
                return Err(error.clone().into());
            }
            if source != "testdev" {
                return Ok(None);
            }

            Ok(Some(ProbeResult {
                channels: Some(vec!["433.92MHz".to_owned()]),
                hardware: Some(options.get("device").cloned().unwrap_or_default()),
                ..Default::default()
            }))
        }

        fn open_source(
            &mut self,
            handle: &DatasourceHandle,
            source: &str,
            _options: &SourceOptions,
        ) -> CallbackResult<Option<OpenResult>> {
            if source != "testdev" {
                return Ok(None);
            }

            *self.opened.lock() = Some(handle.clone());
            Ok(Some(OpenResult {
                dlt: 147,
                capture_interface: Some("testdev".to_owned()),
                ..Default::default()
            }))
        }
    }

    fn definition_request(definition: &str) -> ProbeSource {
        ProbeSource {
            definition: definition.to_owned(),
        }
    }

    #[tokio::test]
    async fn probe_reports_and_spins_down() {
        let (ours, theirs) = Transport::memory_pair();
        let datasource = Datasource::new(ours, TestSource::default());
        let mut peer = Peer::new(theirs);

        let runner = tokio::spawn(datasource.run());

        peer.send_request(
            command::KDS_PROBE_SOURCE,
            7,
            &definition_request("testdev:device=serial123"),
        )
        .await;

        let envelope = peer.read_envelope().await;
        assert_eq!(envelope.command, command::KDS_PROBE_SOURCE_REPORT);
        let report: ProbeSourceReport = serde_json::from_slice(&envelope.content).unwrap();
        assert!(report.success.success);
        assert_eq!(report.success.seqno, 7);
        assert_eq!(report.channels.unwrap(), vec!["433.92MHz"]);
        assert_eq!(report.hardware.unwrap(), "serial123");

        // probing is a one-shot query; the helper terminates cleanly
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn open_keeps_the_session_running() {
        let (ours, theirs) = Transport::memory_pair();
        let source = TestSource::default();
        let opened = source.opened.clone();
        let datasource = Datasource::new(ours, source);
        let handle = datasource.handle();
        let mut peer = Peer::new(theirs);

        let runner = tokio::spawn(datasource.run());

        peer.send_request(
            command::KDS_OPEN_SOURCE,
            3,
            &OpenSource {
                definition: "testdev".to_owned(),
            },
        )
        .await;

        let envelope = peer.read_envelope().await;
        assert_eq!(envelope.command, command::KDS_OPEN_SOURCE_REPORT);
        let report: OpenSourceReport = serde_json::from_slice(&envelope.content).unwrap();
        assert!(report.success.success);
        assert_eq!(report.dlt, 147);

        // the session is still live: data reports flow through the handle
        // captured at open time
        let session = opened.lock().clone().unwrap();
        session.send_data_report(&DataReport {
            json: Some(JsonRecord {
                record_type: "test".to_owned(),
                json: r#"{"value": 1}"#.to_owned(),
                time_sec: 1_700_000_000,
                time_usec: 0,
            }),
            ..Default::default()
        });

        let envelope = peer.read_envelope().await;
        assert_eq!(envelope.command, command::KDS_DATA_REPORT);
        let report: DataReport = serde_json::from_slice(&envelope.content).unwrap();
        assert_eq!(report.json.unwrap().record_type, "test");

        handle.kill();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn callback_errors_become_failure_reports() {
        let (ours, theirs) = Transport::memory_pair();
        let datasource = Datasource::new(
            ours,
            TestSource {
                probe_error: Some("device exploded".to_owned()),
                ..Default::default()
            },
        );
        let mut peer = Peer::new(theirs);

        let runner = tokio::spawn(datasource.run());

        peer.send_request(command::KDS_PROBE_SOURCE, 2, &definition_request("testdev"))
            .await;

        let envelope = peer.read_envelope().await;
        assert_eq!(envelope.command, command::KDS_PROBE_SOURCE_REPORT);
        let report: ProbeSourceReport = serde_json::from_slice(&envelope.content).unwrap();
        assert!(!report.success.success);
        assert_eq!(report.message.unwrap().msgtext, "device exploded");

        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_definition_is_rejected() {
        let (ours, theirs) = Transport::memory_pair();
        let datasource = Datasource::new(ours, TestSource::default());
        let mut peer = Peer::new(theirs);

        let runner = tokio::spawn(datasource.run());

        peer.send_request(
            command::KDS_PROBE_SOURCE,
            1,
            &definition_request("testdev:keywithoutvalue"),
        )
        .await;

        let envelope = peer.read_envelope().await;
        let report: ProbeSourceReport = serde_json::from_slice(&envelope.content).unwrap();
        assert!(!report.success.success);
        assert!(
            report
                .message
                .unwrap()
                .msgtext
                .contains("source definition")
        );

        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unsupported_operations_fail_cleanly() {
        let (ours, theirs) = Transport::memory_pair();
        let datasource = Datasource::new(ours, TestSource::default());
        let handle = datasource.handle();
        let mut peer = Peer::new(theirs);

        let runner = tokio::spawn(datasource.run());

        peer.send_request(command::KDS_CONFIGURE, 4, &Configure::default())
            .await;

        let envelope = peer.read_envelope().await;
        assert_eq!(envelope.command, command::KDS_CONFIGURE_REPORT);
        let report: ConfigureReport = serde_json::from_slice(&envelope.content).unwrap();
        assert!(!report.success.success);
        assert_eq!(report.success.seqno, 4);
        assert!(report.message.is_some());

        // an unsupported configure doesn't end the session
        peer.send_request(command::PING, 5, &wavecap_proto::messages::Ping {})
            .await;
        let envelope = peer.read_envelope().await;
        assert_eq!(envelope.command, command::PONG);

        handle.kill();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unimplemented_listing_is_an_empty_success() {
        let (ours, theirs) = Transport::memory_pair();
        let datasource = Datasource::new(ours, TestSource::default());
        let mut peer = Peer::new(theirs);

        let runner = tokio::spawn(datasource.run());

        peer.send_request(
            command::KDS_LIST_INTERFACES,
            1,
            &wavecap_proto::messages::ListInterfaces {},
        )
        .await;

        let envelope = peer.read_envelope().await;
        assert_eq!(envelope.command, command::KDS_INTERFACES_REPORT);
        let report: InterfacesReport = serde_json::from_slice(&envelope.content).unwrap();
        assert!(report.success.success);
        assert!(report.interfaces.is_empty());

        runner.await.unwrap().unwrap();
    }
}
