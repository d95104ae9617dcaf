//! Open shard URLs as byte streams.
//!
//! | URL form | Opened with |
//! |---|---|
//! | `-` | standard input |
//! | `path/to/shard.tar`, `file:...` | the local filesystem |
//! | `pipe:cmd args` | `sh -c "cmd args"`, reading its stdout |
//! | `http:`, `https:`, `sftp:`, `ftps:`, `scp:` | `curl` |
//! | `gs:` | `gsutil cat` |
//! | `ais:` | `ais get` |
//!
//! Before dispatch, URLs are rewritten with the rules in `GOPEN_REWRITE`
//! (`prefix1=replacement1;prefix2=replacement2`, first match wins), and the
//! schemes listed in `USE_AIS_FOR` (colon separated) are routed through `ais`.

use crate::error::DatasetError;
use crate::io::compression::ShardReader;
use anyhow::{Context, Result};
use regex::{NoExpand, Regex};
use std::fs::File;
use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::LazyLock;
use tracing::{debug, warn};

pub const REWRITE_ENV: &str = "GOPEN_REWRITE";
pub const USE_AIS_ENV: &str = "USE_AIS_FOR";

// Two or more characters, so `C:\shards` stays a path.
static SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9+.\-]+):").expect("valid scheme regex"));

static FILE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^file://?").expect("valid file regex"));

/// The lowercase URL scheme, or `None` for plain paths.
#[must_use]
pub fn url_scheme(url: &str) -> Option<String> {
    SCHEME.captures(url).map(|c| c[1].to_lowercase())
}

/// True for URLs that name a file on this machine.
#[must_use]
pub fn is_local(url: &str) -> bool {
    matches!(url_scheme(url).as_deref(), None | Some("file"))
}

/// Local filesystem path for a `file:` URL or plain path.
#[must_use]
pub fn local_path(url: &str) -> String {
    FILE_PREFIX.replace(url, "").into_owned()
}

/// Apply the first matching rewrite rule from `rules`.
///
/// Each rule is `pattern=replacement`; the pattern is a regex anchored at the
/// start of the URL and the replacement is inserted literally.
#[must_use]
pub fn rewrite_url(url: &str, rules: &str) -> String {
    for rule in rules.split(';').filter(|r| !r.is_empty()) {
        let Some((pattern, replacement)) = rule.split_once('=') else {
            warn!(rule, "ignoring malformed {REWRITE_ENV} rule");
            continue;
        };
        let re = match Regex::new(&format!("^{pattern}")) {
            Ok(re) => re,
            Err(err) => {
                warn!(rule, %err, "ignoring malformed {REWRITE_ENV} rule");
                continue;
            }
        };
        let rewritten = re.replace(url, NoExpand(replacement));
        if rewritten != url {
            debug!(from = url, to = %rewritten, "rewrote url");
            return rewritten.into_owned();
        }
    }
    url.to_string()
}

/// Open `url` for reading.
///
/// # Errors
///
/// Fails when the file does not exist, the helper command cannot be spawned,
/// or the scheme has no opener.
pub fn open_url(url: &str) -> Result<ShardReader> {
    if url == "-" {
        return Ok(Box::new(io::stdin()));
    }
    let url = match std::env::var(REWRITE_ENV) {
        Ok(rules) => rewrite_url(url, &rules),
        Err(_) => url.to_string(),
    };
    let Some(mut scheme) = url_scheme(&url) else {
        let file = File::open(&url).with_context(|| format!("open {url}"))?;
        return Ok(Box::new(file));
    };
    if let Ok(list) = std::env::var(USE_AIS_ENV)
        && list.split(':').any(|s| s.eq_ignore_ascii_case(&scheme))
    {
        scheme = "ais".to_string();
    }

    debug!(%url, %scheme, "opening url");
    match scheme.as_str() {
        "file" => {
            let path = local_path(&url);
            let file = File::open(&path).with_context(|| format!("open {path}"))?;
            Ok(Box::new(file))
        }
        "pipe" => {
            let cmd = &url["pipe:".len()..];
            let mut command = Command::new("sh");
            command.arg("-c").arg(cmd);
            Ok(Box::new(PipeReader::spawn(command, cmd.to_string(), &[141])?))
        }
        "http" | "https" | "sftp" | "ftps" | "scp" => {
            let mut command = Command::new("curl");
            command
                .args(["--connect-timeout", "30", "--retry", "30", "--retry-delay", "2"])
                .args(["-f", "-s", "-L"])
                .arg(&url);
            Ok(Box::new(PipeReader::spawn(command, format!("curl {url}"), &[141, 23])?))
        }
        "gs" => {
            let mut command = Command::new("gsutil");
            command.arg("cat").arg(&url);
            Ok(Box::new(PipeReader::spawn(command, format!("gsutil cat {url}"), &[141, 23])?))
        }
        "ais" => {
            let mut command = Command::new("ais");
            command.arg("get").arg(&url).arg("-");
            Ok(Box::new(PipeReader::spawn(command, format!("ais get {url}"), &[141, 23])?))
        }
        _ => Err(DatasetError::UnsupportedScheme { url: url.clone(), scheme }.into()),
    }
}

/// Reads the stdout of a child process and checks its exit status at EOF.
///
/// Exit codes in `ignore_status` are treated as success (141 is SIGPIPE from
/// the shell, 23 is curl's write error when the reader stops early).
pub struct PipeReader {
    description: String,
    child: Child,
    stdout: ChildStdout,
    ignore_status: Vec<i32>,
    finished: bool,
}

impl PipeReader {
    /// Spawn `command` with a piped stdout.
    ///
    /// # Errors
    ///
    /// Fails if the process cannot be started.
    pub fn spawn(mut command: Command, description: String, ignore_status: &[i32]) -> Result<Self> {
        let mut child = command
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {description}"))?;
        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("{description}: couldn't open stdout"))?;
        Ok(Self {
            description,
            child,
            stdout,
            ignore_status: ignore_status.to_vec(),
            finished: false,
        })
    }

    fn wait_for_child(&mut self) -> io::Result<()> {
        self.finished = true;
        let status = self.child.wait()?;
        if status.success() {
            return Ok(());
        }
        match status.code() {
            Some(code) if self.ignore_status.contains(&code) => Ok(()),
            _ => Err(io::Error::other(format!("{}: {status}", self.description))),
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.finished {
            self.wait_for_child()?;
        }
        Ok(n)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schemes_and_local_paths() {
        assert_eq!(url_scheme("HTTPS://host/a.tar").as_deref(), Some("https"));
        assert_eq!(url_scheme("pipe:curl -s x").as_deref(), Some("pipe"));
        assert_eq!(url_scheme("/data/a.tar"), None);
        assert_eq!(url_scheme("C:\\data\\a.tar"), None);
        assert!(is_local("file:///data/a.tar"));
        assert!(!is_local("gs://b/a.tar"));
        assert_eq!(local_path("file:///data/a.tar"), "/data/a.tar");
    }

    #[test]
    fn first_matching_rewrite_wins() {
        let rules = "gs://bucket/=/mnt/bucket/;gs://=http://mirror/";
        assert_eq!(rewrite_url("gs://bucket/a.tar", rules), "/mnt/bucket/a.tar");
        assert_eq!(rewrite_url("gs://other/a.tar", rules), "http://mirror/other/a.tar");
        assert_eq!(rewrite_url("/local.tar", rules), "/local.tar");
        assert_eq!(rewrite_url("x", "broken;("), "x");
    }

    #[test]
    fn failing_command_is_reported_at_eof() {
        let mut reader = open_url("pipe:printf abc; exit 2").unwrap();
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
        assert_eq!(out, b"abc");
    }
}
