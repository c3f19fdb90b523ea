//! Chat Relay Protocol Constants

// Default listening port of the relay
pub const DEFAULT_PORT: u16 = 54000;

// Default server address used by the console client
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:54000";

// Maximum length of one framed line, in bytes
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

// Maximum length of a display name, in characters
pub const DEFAULT_MAX_NAME_LENGTH: usize = 32;

// Separator between sender name and payload in forwarded messages
pub const CHAT_SEPARATOR: &str = ": ";

// Suffixes of the synthesized system notices
pub const JOIN_SUFFIX: &str = " has joined the chat.";
pub const LEAVE_SUFFIX: &str = " has left the chat.";

// Prompt printed by the console client before the handshake
pub const NAME_PROMPT: &str = "Enter your name: ";
