//! FTP reply codes the client interprets (RFC 959, RFC 2389, RFC 3659).

// Positive preliminary replies
pub const ALREADY_OPEN: i32 = 125;
pub const ABOUT_TO_SEND: i32 = 150;

// Positive completion replies
pub const COMMAND_OK: i32 = 200;
pub const SYSTEM: i32 = 211;
pub const READY: i32 = 220;
pub const CLOSING_DATA_CONNECTION: i32 = 226;
pub const LOGGED_IN: i32 = 230;
pub const REQUESTED_FILE_ACTION_OK: i32 = 250;
pub const PATH_CREATED: i32 = 257;

// Positive intermediate replies
pub const USER_OK: i32 = 331;
pub const REQUEST_FILE_PENDING: i32 = 350;

// Permanent negative replies
pub const NOT_IMPLEMENTED: i32 = 502;
