//! Wire protocol for the wavecap external interface.
//!
//! The host process and a capture helper talk over a duplex byte channel
//! (pipe pair, TCP socket, or the payload of WebSocket messages). Every unit
//! on the wire is a [frame]: a 12-byte big-endian header carrying a magic
//! signature, a checksum and the payload length, followed by the payload.
//! The payload is an encoded [`Envelope`][envelope::Envelope] naming a
//! command, carrying a sequence number and an opaque content blob. Content
//! blobs are the JSON-serialized typed records in [`messages`].

pub mod checksum;
pub mod envelope;
pub mod frame;
pub mod messages;

/// Command names understood by both ends of the interface.
///
/// These are matched case-sensitively; the `KDS` prefix marks the
/// datasource command set.
pub mod command {
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const SHUTDOWN: &str = "SHUTDOWN";
    pub const MESSAGE: &str = "MESSAGE";

    pub const KDS_CONFIGURE: &str = "KDSCONFIGURE";
    pub const KDS_LIST_INTERFACES: &str = "KDSLISTINTERFACES";
    pub const KDS_OPEN_SOURCE: &str = "KDSOPENSOURCE";
    pub const KDS_PROBE_SOURCE: &str = "KDSPROBESOURCE";

    pub const KDS_CONFIGURE_REPORT: &str = "KDSCONFIGUREREPORT";
    pub const KDS_OPEN_SOURCE_REPORT: &str = "KDSOPENSOURCEREPORT";
    pub const KDS_PROBE_SOURCE_REPORT: &str = "KDSPROBESOURCEREPORT";
    pub const KDS_INTERFACES_REPORT: &str = "KDSINTERFACESREPORT";
    pub const KDS_ERROR: &str = "KDSERROR";
    pub const KDS_WARNING_REPORT: &str = "KDSWARNINGREPORT";
    pub const KDS_DATA_REPORT: &str = "KDSDATAREPORT";
    pub const KDS_NEW_SOURCE: &str = "KDSNEWSOURCE";
}
