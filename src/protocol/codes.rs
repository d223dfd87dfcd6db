//! Message codes and header flags shared with reporting clients.
//!
//! Only the codes the transport itself needs to recognise are listed here
//! plus the reporting commands, so that handlers and tests can refer to
//! them by name. Everything else is opaque to the session layer.

/// Liveness probe; never dispatched to the business handler and never logged.
pub const CMD_KEEPALIVE: u16 = 0x0003;
/// Asynchronous notification, the usual payload of a broadcast.
pub const CMD_NOTIFY: u16 = 0x0012;
/// Generic reply to a request.
pub const CMD_REQUEST_COMPLETED: u16 = 0x001D;
/// One chunk of an outbound payload stream.
pub const CMD_FILE_DATA: u16 = 0x0069;
pub const CMD_ABORT_FILE_TRANSFER: u16 = 0x0072;

pub const CMD_RS_LIST_REPORTS: u16 = 0x1100;
pub const CMD_RS_GET_REPORT: u16 = 0x1101;
pub const CMD_RS_SCHEDULE_EXECUTION: u16 = 0x1102;
pub const CMD_RS_LIST_RESULTS: u16 = 0x1103;
pub const CMD_RS_RENDER_RESULT: u16 = 0x1104;
pub const CMD_RS_DELETE_RESULT: u16 = 0x1105;

/// Payload is raw bytes instead of a field table.
pub const MF_BINARY: u16 = 0x0001;
/// Last message of a chunk stream.
pub const MF_END_OF_FILE: u16 = 0x0002;
pub const MF_END_OF_SEQUENCE: u16 = 0x0008;
