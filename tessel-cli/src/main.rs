use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use hf_hub::api::tokio::Api;
use serde::Serialize;
use tessel_core::{DeviceMap, TexturePredictor};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate seamless textures with Stable Diffusion")]
struct Args {
    /// Text prompt for generation
    #[arg(long)]
    prompt: String,

    /// Input image path; switches generation to image-to-image
    #[arg(long)]
    image: Option<PathBuf>,

    /// Output image path
    #[arg(long, default_value = "output.png")]
    output: PathBuf,

    /// Print the result as a single-line JSON object
    #[arg(long)]
    json_output: bool,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Seed for reproducible generation
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Report<'a> {
    Success {
        success: bool,
        output_path: String,
        prompt: &'a str,
    },
    Failure {
        success: bool,
        error: String,
    },
}

impl Report<'_> {
    fn print(&self) {
        match serde_json::to_string(self) {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("Error: failed to serialize report: {err}"),
        }
    }
}

async fn run(args: &Args) -> Result<PathBuf> {
    let api = Api::new()?;
    let mut predictor = TexturePredictor::new(api, DeviceMap::from_cpu_flag(args.cpu));
    predictor
        .generate_texture(&args.prompt, args.image.as_deref(), &args.output, args.seed)
        .await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(&args).await {
        Ok(output_path) => {
            if args.json_output {
                Report::Success {
                    success: true,
                    output_path: output_path.display().to_string(),
                    prompt: &args.prompt,
                }
                .print();
            } else {
                println!("Success! Generated: {}", output_path.display());
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            // the {:?} rendering carries the whole context chain
            let error = format!("{err:?}");
            if args.json_output {
                Report::Failure {
                    success: false,
                    error,
                }
                .print();
            } else {
                eprintln!("Error: {error}");
            }
            ExitCode::FAILURE
        }
    }
}
