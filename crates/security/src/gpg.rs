//! [`PgpBackend`] on top of the `gpg` command line tool.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, warn};

use crate::backend::PgpBackend;
use crate::{PgpError, armor};

const STATUS_PREFIX: &str = "[GNUPG:] ";

pub struct GpgBackend {
    program: PathBuf,
    homedir: Option<PathBuf>,
    passphrase: RwLock<Option<String>>,
}

struct GpgOutput {
    exit: ExitStatus,
    stdout: String,
    status: HashMap<String, String>,
    diagnostics: String,
}

impl GpgBackend {
    pub fn new() -> Self {
        Self::with_program("gpg")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            homedir: None,
            passphrase: RwLock::new(None),
        }
    }

    pub fn homedir(mut self, homedir: impl Into<PathBuf>) -> Self {
        self.homedir = Some(homedir.into());
        self
    }

    /// Whether the gpg binary can be started at all.
    pub fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    fn run(&self, args: &[&str], input: &str) -> Result<GpgOutput, PgpError> {
        let passphrase = self
            .passphrase
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut command = Command::new(&self.program);
        command.args([
            "--batch",
            "--no-tty",
            "--status-fd",
            "2",
            "--armor",
            "--no-secmem-warning",
            "--always-trust",
        ]);
        if let Some(homedir) = &self.homedir {
            command.arg("--homedir").arg(homedir);
        }
        if passphrase.is_some() {
            command.args(["--pinentry-mode", "loopback", "--passphrase-fd", "0"]);
        }
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|error| {
            PgpError::Unavailable(format!("{}: {error}", self.program.display()))
        })?;

        let mut payload = String::new();
        if let Some(passphrase) = passphrase {
            payload.push_str(&passphrase);
            payload.push('\n');
        }
        payload.push_str(input);

        // Written from another thread so a large input cannot deadlock
        // against gpg filling its stdout pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || stdin.write_all(payload.as_bytes()))
        });
        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            match writer.join() {
                Ok(Ok(())) => {}
                Ok(Err(error)) => debug!(error = %error, "gpg closed stdin early"),
                Err(_) => warn!("gpg stdin writer panicked"),
            }
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let (status, diagnostics) = parse_status(&stderr);
        debug!(args = ?args, exit = ?output.status.code(), "gpg finished");
        Ok(GpgOutput {
            exit: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            status,
            diagnostics,
        })
    }
}

impl Default for GpgBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PgpBackend for GpgBackend {
    fn sign(&self, text: &str, key_id: &str) -> Result<String, PgpError> {
        let output = self.run(&["--detach-sign", "--local-user", key_id], text)?;
        if output.status.contains_key("BAD_PASSPHRASE") {
            return Err(PgpError::BadPassphrase);
        }
        let signature = armor::strip(&output.stdout);
        if signature.is_empty() {
            return Err(PgpError::Failed(output.diagnostics));
        }
        Ok(signature)
    }

    fn verify(&self, text: &str, signature: &str) -> Result<Option<String>, PgpError> {
        if text.is_empty() || signature.is_empty() {
            return Ok(None);
        }
        let mut signed = tempfile::NamedTempFile::new()?;
        signed.write_all(text.as_bytes())?;
        signed.flush()?;
        let path = signed.path().to_string_lossy().into_owned();

        let output = self.run(
            &["--verify", "-", path.as_str()],
            &armor::wrap(signature, "SIGNATURE"),
        )?;
        Ok(output
            .status
            .get("GOODSIG")
            .and_then(|args| args.split_whitespace().next())
            .map(str::to_string))
    }

    fn encrypt(&self, text: &str, recipients: &[String]) -> Result<String, PgpError> {
        let mut args = vec!["--encrypt"];
        for recipient in recipients {
            args.push("--recipient");
            args.push(recipient);
        }
        let output = self.run(&args, text)?;
        let ciphertext = armor::strip(&output.stdout);
        if ciphertext.is_empty() {
            return Err(PgpError::Failed(output.diagnostics));
        }
        Ok(ciphertext)
    }

    fn decrypt(&self, ciphertext: &str, key_id: &str) -> Result<String, PgpError> {
        let output = self.run(
            &["--decrypt", "--quiet", "--local-user", key_id],
            &armor::wrap(ciphertext, "MESSAGE"),
        )?;
        if output.status.contains_key("BAD_PASSPHRASE") {
            return Err(PgpError::BadPassphrase);
        }
        let plaintext = output.stdout.replace('\0', "");
        let failed = output.status.contains_key("DECRYPTION_FAILED")
            || !output.exit.success()
            || (plaintext.is_empty() && !output.status.contains_key("DECRYPTION_OKAY"));
        if failed {
            return Err(PgpError::Failed(failure_reason(&output)));
        }
        Ok(plaintext)
    }

    fn list_secret_keys(&self) -> Result<BTreeMap<String, String>, PgpError> {
        let output = self.run(&["--with-colons", "--list-secret-keys"], "")?;
        Ok(parse_secret_keys(&output.stdout))
    }

    fn set_passphrase(&self, passphrase: Option<String>) {
        *self.passphrase.write().unwrap_or_else(PoisonError::into_inner) =
            passphrase.filter(|passphrase| !passphrase.is_empty());
    }
}

/// Split gpg's stderr into `[GNUPG:]` status keywords and the remaining
/// human-readable diagnostics.
fn parse_status(stderr: &str) -> (HashMap<String, String>, String) {
    let mut status = HashMap::new();
    let mut diagnostics = Vec::new();
    for line in stderr.lines() {
        match line.strip_prefix(STATUS_PREFIX) {
            Some(rest) => {
                let (keyword, args) = rest.split_once(' ').unwrap_or((rest, ""));
                status.insert(keyword.to_string(), args.trim_end().to_string());
            }
            None if !line.trim().is_empty() => diagnostics.push(line.trim()),
            None => {}
        }
    }
    (status, diagnostics.join("; "))
}

/// Diagnostics of a failed run, or the status keywords and exit code when
/// gpg printed nothing readable.
fn failure_reason(output: &GpgOutput) -> String {
    if !output.diagnostics.is_empty() {
        return output.diagnostics.clone();
    }
    let mut keywords: Vec<&str> = output.status.keys().map(String::as_str).collect();
    keywords.sort_unstable();
    format!("gpg exited with {} [{}]", output.exit, keywords.join(" "))
}

/// Short key ids of `sec` records mapped to the first user id. Newer gpg
/// versions put the user id on a following `uid` record.
fn parse_secret_keys(listing: &str) -> BTreeMap<String, String> {
    let mut keys = BTreeMap::new();
    let mut pending: Option<String> = None;
    for line in listing.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("sec") => {
                let long_id = fields.get(4).copied().unwrap_or_default();
                let key_id = long_id.get(8..).unwrap_or(long_id).to_string();
                let uid = fields.get(9).copied().unwrap_or_default();
                if uid.is_empty() {
                    pending = Some(key_id);
                } else {
                    keys.insert(key_id, uid.to_string());
                    pending = None;
                }
            }
            Some("uid") => {
                if let Some(key_id) = pending.take() {
                    let uid = fields.get(9).copied().unwrap_or_default();
                    keys.insert(key_id, uid.to_string());
                }
            }
            _ => {}
        }
    }
    if let Some(key_id) = pending {
        keys.insert(key_id, String::new());
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn status_lines_are_separated_from_diagnostics() {
        let stderr = "[GNUPG:] NEWSIG\n\
                      gpg: Signature made Tue 10 Sep 2002\n\
                      [GNUPG:] GOODSIG 0123456789ABCDEF Alice <alice@example.com>\n\
                      [GNUPG:] VALIDSIG AAAA 2002-09-10\n";
        let (status, diagnostics) = parse_status(stderr);

        assert_eq!(status["GOODSIG"], "0123456789ABCDEF Alice <alice@example.com>");
        assert_eq!(status["NEWSIG"], "");
        assert_eq!(diagnostics, "gpg: Signature made Tue 10 Sep 2002");
    }

    #[test]
    fn secret_keys_from_old_and_new_listings() {
        let old = "sec::1024:17:0123456789ABCDEF:2002-09-10::::Alice <alice@example.com>:\n";
        let new = "sec:u:255:22:FEDCBA9876543210:1600000000:::u:::scESC:::+:::ed25519:::0:\n\
                   fpr:::::::::AAAA:\n\
                   uid:u::::1600000000::HASH::Bob <bob@example.com>::::::::::0:\n\
                   ssb:u:255:18:1111111122222222:1600000000::::::e:::+:::cv25519::\n";

        assert_eq!(
            parse_secret_keys(old),
            BTreeMap::from([("89ABCDEF".to_string(), "Alice <alice@example.com>".to_string())])
        );
        assert_eq!(
            parse_secret_keys(new),
            BTreeMap::from([("76543210".to_string(), "Bob <bob@example.com>".to_string())])
        );
        assert!(parse_secret_keys("").is_empty());
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let backend = GpgBackend::with_program("/nonexistent/tern-gpg");
        assert!(!backend.is_available());
        assert_matches!(backend.sign("hello", "ABCD"), Err(PgpError::Unavailable(_)));
    }

    /// A stand-in for gpg that swallows its input, prints `stderr` and
    /// `stdout`, and exits with `code`.
    #[cfg(unix)]
    fn fake_gpg(dir: &tempfile::TempDir, stderr: &str, stdout: &str, code: i32) -> GpgBackend {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("gpg");
        let script = format!(
            "#!/bin/sh\ncat > /dev/null\nprintf '%s' '{stdout}'\nprintf '%s' '{stderr}' >&2\nexit {code}\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        GpgBackend::with_program(path)
    }

    #[cfg(unix)]
    #[test]
    fn decrypt_fails_when_gpg_exits_with_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_gpg(&dir, "[GNUPG:] NODATA 1\n", "", 2);

        assert_matches!(
            backend.decrypt("garbage", "KEY"),
            Err(PgpError::Failed(reason)) if reason.contains("NODATA")
        );
    }

    #[cfg(unix)]
    #[test]
    fn decrypt_without_output_or_success_status_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_gpg(&dir, "[GNUPG:] NO_SECKEY 0123456789ABCDEF\n", "", 0);

        assert_matches!(backend.decrypt("hQEMA5vMIl", "KEY"), Err(PgpError::Failed(_)));
    }

    #[cfg(unix)]
    #[test]
    fn decrypt_returns_the_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_gpg(&dir, "[GNUPG:] DECRYPTION_OKAY\n", "meet at noon", 0);

        assert_eq!(backend.decrypt("hQEMA5vMIl", "KEY").unwrap(), "meet at noon");
    }

    #[test]
    fn verify_of_empty_text_is_unverified() {
        let backend = GpgBackend::with_program("/nonexistent/tern-gpg");
        assert_matches!(backend.verify("", "sig"), Ok(None));
    }
}
