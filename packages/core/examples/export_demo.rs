//! Export a local video against a chosen background
//!
//! Run with: cargo run --example export_demo -p backdrop-core -- input.mp4 green
//!
//! Background argument: original | transparent | green | blur | image | a
//! hex color such as #1E90FF.

use backdrop_core::source::ffmpeg::ensure_ffmpeg;
use backdrop_core::{BackgroundSpec, Color, ExportService, ExportStatus, SourceRef};
use std::path::PathBuf;

fn parse_background(arg: &str) -> anyhow::Result<BackgroundSpec> {
    Ok(match arg {
        "original" => BackgroundSpec::Original,
        "transparent" => BackgroundSpec::TransparentPassthrough,
        "green" => BackgroundSpec::GreenScreen,
        "blur" => BackgroundSpec::Blur,
        "image" => BackgroundSpec::Image(None),
        hex if hex.starts_with('#') => BackgroundSpec::SolidColor(
            Color::from_hex(hex).ok_or_else(|| anyhow::anyhow!("invalid hex color: {hex}"))?,
        ),
        other => anyhow::bail!("unknown background: {other}"),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let input = PathBuf::from(
        args.next()
            .ok_or_else(|| anyhow::anyhow!("usage: export_demo <input> [background]"))?,
    );
    let spec = parse_background(&args.next().unwrap_or_else(|| "green".to_string()))?;

    println!("Checking ffmpeg...");
    ensure_ffmpeg()?;

    let mut service = ExportService::with_ffmpeg()?;
    let mut rx = service.start_export(spec, SourceRef::Path(input)).await;

    let mut last_printed = -10.0f32;
    loop {
        let (status, progress) = {
            let job = rx.borrow();
            (job.status, job.progress_percent)
        };
        if progress - last_printed >= 10.0 {
            println!("  {:?} {:.0}%", status, progress);
            last_printed = progress;
        }
        if status.is_terminal() {
            break;
        }
        if rx.changed().await.is_err() {
            break;
        }
    }

    let job = rx.borrow().clone();
    match job.status {
        ExportStatus::Done => {
            let artifact = job
                .artifact
                .ok_or_else(|| anyhow::anyhow!("done without artifact"))?;
            let ext = if artifact.media_type == "video/webm" {
                "webm"
            } else {
                "mp4"
            };
            let output = PathBuf::from(format!("backdrop_export.{ext}"));
            std::fs::write(&output, &artifact.data)?;
            println!(
                "\n✓ Export complete: {:?} ({} KB, {})",
                output,
                artifact.data.len() / 1024,
                artifact.media_type
            );
        }
        ExportStatus::Failed => {
            let detail = job.error_detail.map(|d| d.message).unwrap_or_default();
            anyhow::bail!("export failed: {detail}");
        }
        other => anyhow::bail!("export ended in unexpected state {other:?}"),
    }

    Ok(())
}
