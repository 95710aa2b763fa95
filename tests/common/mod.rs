// MIT License - Copyright (c) 2026 pico-sync contributors
// Simulated MicroPython board for integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

use pico_sync::transport::mock::{MockTransport, Responder};
use pico_sync::transport::TransportKind;
use pico_sync::{Board, BoardConfig};

const RAW_BANNER: &str = "raw REPL; CTRL-B to exit\r\n>";
const FRIENDLY_BANNER: &str = "\r\nMicroPython v1.22.0 on 2024-01-01; Raspberry Pi Pico W with RP2040\r\n\
Type \"help()\" for more information.\r\n>>> ";

/// In-memory file system of the simulated board.
#[derive(Debug, Default)]
pub struct FakeFs {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    open: Option<(String, Vec<u8>)>,
    /// Make every folder creation fail with an `OSError`
    pub fail_mkdir: bool,
    /// Every executed raw REPL program, in order
    pub programs: Vec<String>,
}

impl FakeFs {
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn count_programs(&self, needle: &str) -> usize {
        self.programs.iter().filter(|p| p.contains(needle)).count()
    }

    fn parent_exists(&self, path: &str) -> bool {
        match path.rsplit_once('/') {
            Some((parent, _)) => self.dirs.contains(parent),
            None => true,
        }
    }
}

/// Responder answering the REPL control characters and the snippets the
/// shell injects, backed by a `FakeFs`.
#[derive(Clone, Default)]
pub struct FakePico {
    pub fs: Arc<Mutex<FakeFs>>,
}

impl FakePico {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        {
            let mut fs = self.fs.lock().unwrap();
            let mut parent = path;
            while let Some((dir, _)) = parent.rsplit_once('/') {
                fs.dirs.insert(dir.to_string());
                parent = dir;
            }
            fs.files.insert(path.to_string(), content.to_vec());
        }
        self
    }

    pub fn fs(&self) -> std::sync::MutexGuard<'_, FakeFs> {
        self.fs.lock().unwrap()
    }

    /// Board connected to this fake over a serial-looking mock transport.
    pub async fn connect(&self) -> (Board, Arc<MockTransport>) {
        let board = Board::new(BoardConfig::builder().ping_interval_ms(0).build());
        let (transport, events) = MockTransport::with_kind(TransportKind::Serial, self.clone());
        board
            .connect_transport("/dev/ttyACM0", transport.clone(), events)
            .await
            .unwrap();
        (board, transport)
    }

    fn execute(&self, program: &str) -> (String, String) {
        let mut fs = self.fs.lock().unwrap();
        fs.programs.push(program.to_string());
        let args = quoted(program);

        if program.contains("os.statvfs(") {
            return ok("1441792");
        }
        if program.contains("def ensureFolder") {
            if fs.fail_mkdir {
                return os_error("EIO");
            }
            for line in program.lines().filter(|l| l.starts_with("ensureFolder(")) {
                if let Some(folder) = quoted(line).into_iter().next() {
                    fs.dirs.insert(folder);
                }
            }
            return ok("");
        }
        if program.contains("f.seek(") {
            let path = normalize(&args[0]);
            let Some(content) = fs.files.get(&path) else {
                return os_error("ENOENT");
            };
            let offset = number_after(program, "f.seek(");
            let length = number_after(program, "n = ");
            let chunk = number_after(program, "min(n, ").max(1);
            let end = (offset + length).min(content.len());
            let start = offset.min(end);
            let out: String = content[start..end]
                .chunks(chunk)
                .map(|c| format!("{}\n", BASE64.encode(c)))
                .collect();
            return ok(&out);
        }
        if program.contains("def _ls(") {
            let call = program.lines().find(|l| l.starts_with("print(json.dumps(_ls(")).unwrap_or("");
            let dir = normalize(&quoted(call)[0]);
            if !dir.is_empty() && !fs.dirs.contains(&dir) {
                return os_error("ENOENT");
            }
            let with_hash = call.contains("True");
            let mut entries = Vec::new();
            for d in fs.dirs.iter().filter(|d| parent_of(d) == dir) {
                entries.push(serde_json::json!([name_of(d), "d", 0, null]));
            }
            for (path, content) in fs.files.iter().filter(|(p, _)| parent_of(p) == dir) {
                let hash = with_hash.then(|| hex::encode(Sha256::digest(content)));
                entries.push(serde_json::json!([name_of(path), "f", content.len(), hash]));
            }
            return ok(&format!("{}\r\n", serde_json::Value::Array(entries)));
        }
        if program.contains("os.remove(") {
            return match fs.files.remove(&normalize(&args[0])) {
                Some(_) => ok(""),
                None => os_error("ENOENT"),
            };
        }
        if program.contains("os.rmdir(") {
            let dir = normalize(&args[0]);
            let prefix = format!("{dir}/");
            if fs.files.keys().chain(fs.dirs.iter()).any(|p| p.starts_with(&prefix)) {
                return os_error("EACCES");
            }
            return match fs.dirs.remove(&dir) {
                true => ok(""),
                false => os_error("ENOENT"),
            };
        }
        if program.contains("os.mkdir(") {
            fs.dirs.insert(normalize(&args[0]));
            return ok("");
        }
        if program.contains("os.rename(") {
            let from = normalize(&args[0]);
            let to = normalize(&args[1]);
            return match fs.files.remove(&from) {
                Some(content) => {
                    fs.files.insert(to, content);
                    ok("")
                }
                None => os_error("ENOENT"),
            };
        }
        if program.contains("f = open(") {
            let path = normalize(&args[0]);
            if !fs.parent_exists(&path) {
                return os_error("ENOENT");
            }
            fs.open = Some((path, Vec::new()));
            return ok("");
        }
        if program.starts_with("f.write(ubinascii.a2b_base64(") {
            let data = BASE64.decode(&args[0]).unwrap_or_default();
            return match fs.open.as_mut() {
                Some((_, buffer)) => {
                    buffer.extend_from_slice(&data);
                    ok("")
                }
                None => name_error("f"),
            };
        }
        if program == "f.close()" {
            return match fs.open.take() {
                Some((path, content)) => {
                    fs.files.insert(path, content);
                    ok("")
                }
                None => name_error("f"),
            };
        }
        if program.contains("print(\"Done\")") {
            return ok("Done\r\n");
        }
        if program.contains("_h = uhashlib.sha256()") {
            return match fs.files.get(&normalize(&args[0])) {
                Some(content) => ok(&hex::encode(Sha256::digest(content))),
                None => os_error("ENOENT"),
            };
        }
        if let Some(value) = program.strip_prefix("print(").and_then(|p| p.lines().next()) {
            return ok(&format!("{}\r\n", value.trim_end_matches(')').trim_matches('\'')));
        }
        ok("")
    }
}

impl Responder for FakePico {
    fn respond(&mut self, data: &[u8]) -> Vec<u8> {
        match data {
            b"\x01" => RAW_BANNER.as_bytes().to_vec(),
            b"\x02" | b"\x06" => FRIENDLY_BANNER.as_bytes().to_vec(),
            d if d.starts_with(b"\x03") => b"\r\n>>> ".to_vec(),
            d if d.ends_with(b"\x04") => {
                let text = String::from_utf8_lossy(&d[..d.len() - 1]);
                let program = text.trim_end_matches("\r\n");
                let (stdout, stderr) = self.execute(program);
                format!("OK{stdout}\x04{stderr}\x04>").into_bytes()
            }
            _ => Vec::new(),
        }
    }
}

fn ok(stdout: &str) -> (String, String) {
    (stdout.to_string(), String::new())
}

fn os_error(errno: &str) -> (String, String) {
    (
        String::new(),
        format!("Traceback (most recent call last):\r\n  File \"<stdin>\", line 2, in <module>\r\nOSError: [Errno 2] {errno}\r\n"),
    )
}

fn name_error(name: &str) -> (String, String) {
    (
        String::new(),
        format!("Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nNameError: name '{name}' isn't defined\r\n"),
    )
}

fn normalize(path: &str) -> String {
    path.trim_start_matches('/').trim_end_matches('/').to_string()
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

fn name_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, n)| n).unwrap_or(path)
}

fn number_after(program: &str, marker: &str) -> usize {
    program
        .split(marker)
        .nth(1)
        .map(|rest| rest.chars().take_while(char::is_ascii_digit).collect::<String>())
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

/// All single-quoted Python string literals in `code`, unescaped.
fn quoted(code: &str) -> Vec<String> {
    let mut literals = Vec::new();
    let mut chars = code.chars();
    while let Some(c) = chars.next() {
        if c != '\'' {
            continue;
        }
        let mut literal = String::new();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        literal.push(match escaped {
                            'n' => '\n',
                            'r' => '\r',
                            other => other,
                        });
                    }
                }
                '\'' => break,
                c => literal.push(c),
            }
        }
        literals.push(literal);
    }
    literals
}
