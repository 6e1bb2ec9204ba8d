//! Bounded capture of child stdout, with optional tee to an output file.
//!
//! Output is read in chunks into an in-memory buffer capped at the
//! command's size limit. Once the cap is hit the pipe is still drained so
//! the child never blocks on a full pipe, but further bytes are dropped
//! and the result is marked truncated. The tee file receives exactly the
//! bytes the buffer kept.

use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdout;

/// What the reader task hands back after the pipe closes.
#[derive(Debug)]
pub struct CaptureResult {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

/// Drain `stdout` to completion, keeping at most `limit` bytes.
pub async fn capture_stdout(
    mut stdout: ChildStdout,
    limit: u64,
    tee: Option<std::fs::File>,
) -> io::Result<CaptureResult> {
    let mut tee = tee.map(tokio::fs::File::from_std);
    let mut bytes: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];

    loop {
        let n = stdout.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = (limit as usize).saturating_sub(bytes.len());
        if remaining == 0 {
            // Past the cap: keep draining so the child doesn't block, but
            // discard the data.
            truncated = true;
            continue;
        }

        let keep = remaining.min(n);
        if keep < n {
            truncated = true;
        }
        bytes.extend_from_slice(&chunk[..keep]);
        if let Some(file) = tee.as_mut() {
            file.write_all(&chunk[..keep]).await?;
        }
    }

    if let Some(file) = tee.as_mut() {
        file.flush().await?;
    }

    Ok(CaptureResult { bytes, truncated })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    async fn capture_from(script: &str, limit: u64) -> CaptureResult {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let result = capture_stdout(stdout, limit, None).await.unwrap();
        child.wait().await.unwrap();
        result
    }

    #[tokio::test]
    async fn test_output_under_limit_is_kept_whole() {
        let result = capture_from("printf abc", 16).await;
        assert_eq!(result.bytes, b"abc");
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_output_exactly_at_limit_is_not_truncated() {
        let result = capture_from("printf abcd", 4).await;
        assert_eq!(result.bytes, b"abcd");
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_output_one_past_limit_truncates() {
        let result = capture_from("printf abcde", 4).await;
        assert_eq!(result.bytes, b"abcd");
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_tee_receives_capped_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let tee = std::fs::File::create(&path).unwrap();

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("printf 0123456789")
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let result = capture_stdout(stdout, 6, Some(tee)).await.unwrap();
        child.wait().await.unwrap();

        assert_eq!(result.bytes, b"012345");
        assert!(result.truncated);
        assert_eq!(std::fs::read(&path).unwrap(), b"012345");
    }
}
