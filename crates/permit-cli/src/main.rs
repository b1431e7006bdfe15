use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use permit_core::decoder::rgb_to_gray;
use permit_core::{CascadeDetector, DetectParams, FaceDetector};
use std::path::PathBuf;

mod client;

use client::{encode_file, PermitClient};

#[derive(Parser)]
#[command(name = "permit", about = "Permit face registration and authentication CLI")]
struct Cli {
    /// Base URL of the permitd server
    #[arg(long, global = true, env = "PERMIT_SERVER", default_value = "http://127.0.0.1:8000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register face images for an identity (replaces any earlier model)
    Scan {
        /// Identity to register
        #[arg(short, long)]
        id: String,
        /// Image files (JPEG, PNG, ...)
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Authenticate an image against an identity and print the passcode
    Authenticate {
        #[arg(short, long)]
        id: String,
        image: PathBuf,
    },
    /// Show server health
    Status,
    /// Run the face detector locally on an image file
    Detect {
        /// Haar cascade XML
        #[arg(long, env = "PERMIT_CASCADE_PATH")]
        cascade: PathBuf,
        #[arg(long, default_value_t = 1.1)]
        scale_factor: f64,
        #[arg(long, default_value_t = 3)]
        min_neighbors: u32,
        image: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { id, images } => {
            let encoded = images
                .iter()
                .map(|path| encode_file(path))
                .collect::<Result<Vec<_>>>()?;
            tracing::debug!(identity = %id, images = encoded.len(), "sending scan");

            let client = PermitClient::new(&cli.server);
            if !client.scan(&id, &encoded).await? {
                bail!("server did not complete registration");
            }
            println!("Registered {} image(s) for {id}", encoded.len());
        }
        Commands::Authenticate { id, image } => {
            let encoded = encode_file(&image)?;
            let client = PermitClient::new(&cli.server);
            let passcode = require_passcode(client.authenticate(&id, &encoded).await?, &id)?;
            println!("{passcode}");
        }
        Commands::Status => {
            let health = PermitClient::new(&cli.server).health().await?;
            println!("permitd {}: {}", health.version, health.status);
        }
        Commands::Detect {
            cascade,
            scale_factor,
            min_neighbors,
            image,
        } => {
            let detector = CascadeDetector::load(&cascade)
                .with_context(|| format!("failed to load cascade {}", cascade.display()))?;
            let rgb = image::open(&image)
                .with_context(|| format!("failed to open {}", image.display()))?
                .to_rgb8();
            let gray = rgb_to_gray(&rgb);

            let params = DetectParams::new(scale_factor, min_neighbors);
            let faces = detector.detect(&gray, &params)?;
            println!("{} face(s) in {}x{} image", faces.len(), gray.width(), gray.height());
            for face in faces {
                println!("  x={} y={} width={} height={}", face.x, face.y, face.width, face.height);
            }
        }
    }

    Ok(())
}

/// A `null` passcode means the server did not recognize the face.
fn require_passcode(passcode: Option<String>, id: &str) -> Result<String> {
    passcode.with_context(|| format!("face not recognized for {id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_passcode_is_an_error() {
        assert_eq!(require_passcode(Some("042917".into()), "alice").unwrap(), "042917");
        let err = require_passcode(None, "alice").unwrap_err();
        assert_eq!(err.to_string(), "face not recognized for alice");
    }
}
