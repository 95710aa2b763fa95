// MIT License - Copyright (c) 2026 pico-sync contributors
// MicroPython code injected through the raw REPL

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Bytes read per segment by `Snippet::ReadFile`. The base64 output of one
/// segment stays well below the receive buffer cap.
pub const READ_SEGMENT_LEN: usize = 8 * 1024;

/// Marker printed by `Snippet::ProbeHashlib` when hashing is available.
pub const PROBE_OK: &str = "Done";

/// Code sent to the board for each file-system operation.
///
/// Every snippet is executed in the raw REPL; results are written to stdout
/// and parsed by the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snippet<'a> {
    /// Free bytes on the file system holding `root`
    FreeSpace { root: &'a str },
    /// Create each folder in order, ignoring the ones that exist
    EnsureFolders { folders: Vec<String> },
    /// Base64 lines for `length` bytes of `path` starting at `offset`
    ReadFile {
        path: &'a str,
        offset: u64,
        length: usize,
        chunk_size: usize,
    },
    /// JSON array of `[name, kind, size, sha256|null]` for one directory;
    /// kind is `f`, `d` or `e` (stat failed)
    ListDir { path: &'a str, hash: bool },
    RemoveFile { path: &'a str },
    RenameFile { from: &'a str, to: &'a str },
    MakeDir { path: &'a str },
    ChangeDir { path: &'a str },
    RemoveDir { path: &'a str },
    /// Hard reset; the board never answers
    Reset,
    /// Open `path` for writing as the global `f`
    OpenForWrite { path: &'a str },
    /// Append one chunk to the open `f`
    WriteChunk { data: &'a [u8] },
    CloseFile,
    /// Prints `PROBE_OK` if `uhashlib` can be imported
    ProbeHashlib,
    /// Hex SHA-256 of `path`, read `chunk_size` bytes at a time
    HashFile { path: &'a str, chunk_size: usize },
}

impl Snippet<'_> {
    /// Python source for this snippet, lines joined with `\r\n`.
    pub fn render(&self) -> String {
        match self {
            Snippet::FreeSpace { root } => lines(&[
                "import os, sys".to_string(),
                format!("_s = os.statvfs({})", py_str(root)),
                "sys.stdout.write(str(_s[0]*_s[3]))".to_string(),
                "del(_s)".to_string(),
            ]),
            Snippet::EnsureFolders { folders } => {
                let mut code = vec![
                    "import os".to_string(),
                    "def ensureFolder(folder):".to_string(),
                    "  try:".to_string(),
                    "    os.mkdir(folder)".to_string(),
                    "  except OSError:".to_string(),
                    "    pass".to_string(),
                    String::new(),
                ];
                code.extend(folders.iter().map(|f| format!("ensureFolder({})", py_str(f))));
                lines(&code)
            }
            Snippet::ReadFile {
                path,
                offset,
                length,
                chunk_size,
            } => lines(&[
                "import ubinascii,sys".to_string(),
                format!("with open({}, 'rb') as f:", py_str(path)),
                format!("  f.seek({offset})"),
                format!("  n = {length}"),
                "  while n > 0:".to_string(),
                format!("    c = f.read(min(n, {}))", (*chunk_size).max(1)),
                "    if not c:".to_string(),
                "      break".to_string(),
                "    n -= len(c)".to_string(),
                "    sys.stdout.write(ubinascii.b2a_base64(c))".to_string(),
            ]),
            Snippet::ListDir { path, hash } => lines(&[
                "import uos as os, json".to_string(),
                "try:".to_string(),
                "  import uhashlib,ubinascii".to_string(),
                "except ImportError:".to_string(),
                "  uhashlib = None".to_string(),
                "def _ls(path, gethash):".to_string(),
                "  li = []".to_string(),
                "  for name in os.listdir(path):".to_string(),
                "    full = path + name if path.endswith('/') else path + '/' + name".to_string(),
                "    try:".to_string(),
                "      st = os.stat(full)".to_string(),
                "      if st[0] & 0x4000:".to_string(),
                "        li.append([name, 'd', 0, None])".to_string(),
                "      else:".to_string(),
                "        h = None".to_string(),
                "        if gethash and uhashlib:".to_string(),
                "          with open(full, 'rb') as f:".to_string(),
                "            h = ubinascii.hexlify(uhashlib.sha256(f.read()).digest()).decode()".to_string(),
                "        li.append([name, 'f', st[6], h])".to_string(),
                "    except OSError:".to_string(),
                "      li.append([name, 'e', 0, None])".to_string(),
                "  return li".to_string(),
                format!("print(json.dumps(_ls({}, {})))", py_str(path), py_bool(*hash)),
                "del(_ls)".to_string(),
            ]),
            Snippet::RemoveFile { path } => os_call("remove", &[path]),
            Snippet::RenameFile { from, to } => os_call("rename", &[from, to]),
            Snippet::MakeDir { path } => os_call("mkdir", &[path]),
            Snippet::ChangeDir { path } => os_call("chdir", &[path]),
            Snippet::RemoveDir { path } => os_call("rmdir", &[path]),
            Snippet::Reset => lines(&["import machine".to_string(), "machine.reset()".to_string()]),
            Snippet::OpenForWrite { path } => lines(&[
                "import ubinascii".to_string(),
                format!("f = open({}, 'wb')", py_str(path)),
            ]),
            Snippet::WriteChunk { data } => {
                format!("f.write(ubinascii.a2b_base64('{}'))", BASE64.encode(data))
            }
            Snippet::CloseFile => "f.close()".to_string(),
            Snippet::ProbeHashlib => {
                lines(&["import uhashlib".to_string(), format!("print(\"{PROBE_OK}\")")])
            }
            Snippet::HashFile { path, chunk_size } => lines(&[
                "import uhashlib,ubinascii,sys".to_string(),
                "_h = uhashlib.sha256()".to_string(),
                format!("with open({}, 'rb') as f:", py_str(path)),
                "  while True:".to_string(),
                format!("    c = f.read({})", (*chunk_size).max(1)),
                "    if not c:".to_string(),
                "      break".to_string(),
                "    _h.update(c)".to_string(),
                "sys.stdout.write(ubinascii.hexlify(_h.digest()))".to_string(),
                "del(_h)".to_string(),
            ]),
        }
    }
}

fn lines(code: &[String]) -> String {
    code.join("\r\n")
}

fn os_call(function: &str, args: &[&str]) -> String {
    let args: Vec<String> = args.iter().map(|a| py_str(a)).collect();
    lines(&["import os".to_string(), format!("os.{}({})", function, args.join(", "))])
}

fn py_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Single-quoted Python string literal.
pub fn py_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_py_str_escapes_quotes() {
        assert_eq!(py_str("main.py"), "'main.py'");
        assert_eq!(py_str("it's"), "'it\\'s'");
        assert_eq!(py_str("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn test_write_chunk_is_base64() {
        let code = Snippet::WriteChunk { data: b"hello" }.render();
        assert_eq!(code, "f.write(ubinascii.a2b_base64('aGVsbG8='))");
    }

    #[test]
    fn test_os_calls() {
        assert_eq!(
            Snippet::RemoveFile { path: "lib/x.py" }.render(),
            "import os\r\nos.remove('lib/x.py')"
        );
        assert_eq!(
            Snippet::RenameFile { from: "a", to: "b" }.render(),
            "import os\r\nos.rename('a', 'b')"
        );
    }

    #[test]
    fn test_ensure_folders_lists_every_level() {
        let code = Snippet::EnsureFolders {
            folders: vec!["lib".to_string(), "lib/net".to_string()],
        }
        .render();
        assert!(code.ends_with("ensureFolder('lib')\r\nensureFolder('lib/net')"));
        assert!(code.contains("except OSError:"));
    }

    #[test]
    fn test_read_file_segment() {
        let code = Snippet::ReadFile {
            path: "main.py",
            offset: 8192,
            length: 8192,
            chunk_size: 512,
        }
        .render();
        assert!(code.contains("with open('main.py', 'rb') as f:"));
        assert!(code.contains("  f.seek(8192)"));
        assert!(code.contains("c = f.read(min(n, 512))"));
    }

    #[test]
    fn test_list_dir_call() {
        let code = Snippet::ListDir { path: "/", hash: true }.render();
        assert!(code.contains("print(json.dumps(_ls('/', True)))"));
    }
}
