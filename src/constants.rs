// MIT License - Copyright (c) 2026 pico-sync contributors
// Wire-level constants of the MicroPython REPL

/// Ctrl-A: enter raw REPL.
pub const CTRL_A: &str = "\x01";
/// Ctrl-B: leave raw REPL, back to the friendly REPL.
pub const CTRL_B: &str = "\x02";
/// Ctrl-C: interrupt the running program.
pub const CTRL_C: &str = "\x03";
/// Ctrl-D: soft reset in the friendly REPL, execute in raw/paste mode.
pub const CTRL_D: &str = "\x04";
/// Ctrl-E: enter paste mode.
pub const CTRL_E: &str = "\x05";
/// Ctrl-F: safe boot.
pub const CTRL_F: &str = "\x06";

/// All single-character control commands understood by the REPL.
pub const CONTROL_CHARS: [&str; 6] = [CTRL_A, CTRL_B, CTRL_C, CTRL_D, CTRL_E, CTRL_F];

/// End-of-transmission byte framing raw REPL output.
pub const EOT: char = '\x04';

/// Banner printed after entering the raw REPL.
pub const RAW_REPL_BANNER: &str = "raw REPL; CTRL-B to exit\r\n>";
/// Prompt of the friendly REPL.
pub const FRIENDLY_PROMPT: &str = ">>> ";
/// Tail of the banner printed when the friendly REPL (re)starts.
pub const FRIENDLY_BANNER: &str = "Type \"help()\" for more information.\r\n>>>";
/// Banner printed after entering paste mode.
pub const PASTE_MODE_BANNER: &str = "paste mode; Ctrl-C to cancel, Ctrl-D to finish";

/// Raw REPL responses end with `EOT >`, optionally preceded by a line break.
pub const RAW_PROMPT_PATTERN: &str = r"(\r\n)?\x04>";

/// Receive buffer cap. Exceeding it drops the oldest half.
pub const MAX_BUFFER_LEN: usize = 80_000;

/// Default timeout of a single `send_wait`, in milliseconds.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5_000;

/// Consecutive ping failures after which the connection is considered lost.
pub const MAX_PING_FAILURES: u32 = 2;

/// Telnet login prompts and banners.
pub const LOGIN_PROMPT: &str = "Login as:";
pub const PASSWORD_PROMPT: &str = "Password:";
pub const LOGIN_SUCCEEDED: &str = "Login succeeded!\r\nType \"help()\" for more information.\r\n";
pub const INVALID_CREDENTIALS: &str = "Invalid credentials, try again.";

/// Telnet command bytes.
pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const AYT: u8 = 246;
pub const SE: u8 = 240;

/// Telnet options we answer specially.
pub const OPT_TERMINAL_TYPE: u8 = 24;
pub const OPT_WINDOW_SIZE: u8 = 31;

/// Escape byte doubled on raw sockets.
pub const ESC: u8 = 0x1b;

/// Default telnet / raw socket port.
pub const DEFAULT_TCP_PORT: u16 = 23;
