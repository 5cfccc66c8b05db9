// Copyright (C) 2026 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Opens the H.264 byte source: a file, stdin, or an `ffmpeg` child process.

use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Error};
use log::info;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

pub(crate) type Reader = Box<dyn AsyncRead + Send + Unpin>;

/// A byte source, plus the child process producing it (if any).
pub(crate) struct Source {
    pub(crate) reader: Reader,
    pub(crate) child: Option<Child>,
}

/// Opens `input` (`-` meaning stdin) or, if absent, spawns `ffmpeg` with
/// `ffmpeg_args` and reads its stdout.
///
/// `ffmpeg` is expected to write a raw Annex B stream to stdout, eg with
/// `-f h264 -`.
pub(crate) async fn open(input: Option<&Path>, ffmpeg_args: &[String]) -> Result<Source, Error> {
    let reader: Reader = match input {
        Some(p) if p == Path::new("-") => {
            info!("Reading H.264 from stdin");
            Box::new(tokio::io::stdin())
        }
        Some(p) => {
            info!("Reading H.264 from {}", p.display());
            let f = tokio::fs::File::open(p)
                .await
                .with_context(|| format!("unable to open {}", p.display()))?;
            Box::new(f)
        }
        None => {
            if ffmpeg_args.is_empty() {
                bail!("either --input or ffmpeg arguments are required");
            }
            info!("Running ffmpeg with args: {:?}", ffmpeg_args);
            let mut child = Command::new("ffmpeg")
                .args(ffmpeg_args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .context("unable to spawn ffmpeg")?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| anyhow!("ffmpeg has no stdout"))?;
            return Ok(Source {
                reader: Box::new(stdout),
                child: Some(child),
            });
        }
    };
    Ok(Source {
        reader,
        child: None,
    })
}

/// Waits for `ffmpeg` to exit after its stdout is drained, failing on a non-zero status.
pub(crate) async fn finish(child: Option<Child>) -> Result<(), Error> {
    let Some(mut child) = child else {
        return Ok(());
    };
    let status = child.wait().await.context("unable to wait for ffmpeg")?;
    if !status.success() {
        bail!("ffmpeg exited with {status}");
    }
    Ok(())
}
