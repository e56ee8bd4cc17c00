// gogh — command-line neural style transfer
//
// Usage:
//   gogh -c content.jpg -s style.jpg
//   gogh -c content.jpg -s style.jpg -o out/painted.png --steps 500
//   gogh -c content.jpg -s style.jpg --style-weight 1e7 --size 256
//
// The pretrained VGG-19 weights are an explicit input (a .safetensors
// file with torchvision's features.{idx}.weight/bias key layout); pass
// --weights if the file is not at ./vgg19.safetensors.

use std::path::PathBuf;
use std::process::ExitCode;

use gogh::prelude::*;

struct Config {
    content: PathBuf,
    style: PathBuf,
    output: PathBuf,
    weights: PathBuf,
    size: usize,
    steps: usize,
    style_weight: f64,
    content_weight: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            content: PathBuf::new(),
            style: PathBuf::new(),
            output: PathBuf::from("output.jpg"),
            weights: PathBuf::from("vgg19.safetensors"),
            size: 512,
            steps: 300,
            style_weight: 1_000_000.0,
            content_weight: 1.0,
        }
    }
}

fn print_help() {
    println!("gogh — neural style transfer");
    println!();
    println!("Usage: gogh --content <path> --style <path> [options]");
    println!();
    println!("Options:");
    println!("  -c, --content <path>       Content image (required)");
    println!("  -s, --style <path>         Style image (required)");
    println!("  -o, --output <path>        Output image (default: output.jpg)");
    println!("      --weights <path>       VGG-19 weights in safetensors format");
    println!("                             (default: vgg19.safetensors)");
    println!("      --size <n>             Output size (default: 512; capped on CPU)");
    println!("      --steps <n>            Optimization steps (default: 300)");
    println!("      --style-weight <f>     Style loss weight (default: 1000000)");
    println!("      --content-weight <f>   Content loss weight (default: 1)");
    println!("  -h, --help                 Show this help");
}

fn parse_args() -> Result<Config, String> {
    let mut cfg = Config::default();
    let mut have_content = false;
    let mut have_style = false;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = |i: &mut usize| -> Result<String, String> {
            *i += 1;
            args.get(*i)
                .cloned()
                .ok_or_else(|| format!("missing value for {flag}"))
        };
        match flag {
            "--content" | "-c" => {
                cfg.content = PathBuf::from(value(&mut i)?);
                have_content = true;
            }
            "--style" | "-s" => {
                cfg.style = PathBuf::from(value(&mut i)?);
                have_style = true;
            }
            "--output" | "-o" => {
                cfg.output = PathBuf::from(value(&mut i)?);
            }
            "--weights" => {
                cfg.weights = PathBuf::from(value(&mut i)?);
            }
            "--size" => {
                let v = value(&mut i)?;
                cfg.size = v.parse().map_err(|_| format!("invalid --size: {v}"))?;
            }
            "--steps" => {
                let v = value(&mut i)?;
                cfg.steps = v.parse().map_err(|_| format!("invalid --steps: {v}"))?;
            }
            "--style-weight" => {
                let v = value(&mut i)?;
                cfg.style_weight = v
                    .parse()
                    .map_err(|_| format!("invalid --style-weight: {v}"))?;
            }
            "--content-weight" => {
                let v = value(&mut i)?;
                cfg.content_weight = v
                    .parse()
                    .map_err(|_| format!("invalid --content-weight: {v}"))?;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    if !have_content {
        return Err("missing required --content".to_string());
    }
    if !have_style {
        return Err("missing required --style".to_string());
    }
    Ok(cfg)
}

fn run(cfg: &Config) -> gogh::Result<()> {
    // Input checks before any heavy work.
    for (label, path) in [
        ("Content image", &cfg.content),
        ("Style image", &cfg.style),
        ("Weights file", &cfg.weights),
    ] {
        if !path.exists() {
            println!("Error: {label} not found at {}", path.display());
            return Err(gogh::Error::FileNotFound(path.clone()));
        }
    }

    let device = gogh::device::default_device();
    println!("Using device: {}", device.name().to_uppercase());

    println!("Loading VGG-19 weights from: {}", cfg.weights.display());
    let state_dict = gogh::weights::load_state_dict::<CpuBackend>(&cfg.weights, &device)?;
    let vgg = FeatureExtractor::vgg19(&state_dict, Pooling::Max)?;

    let stylize_config = StylizeConfig {
        output_size: cfg.size,
        num_steps: cfg.steps,
        style_weight: cfg.style_weight,
        content_weight: cfg.content_weight,
        ..StylizeConfig::default()
    };

    let output = stylize_image(&vgg, &cfg.content, &cfg.style, &stylize_config, &device)?;
    gogh::image_io::save_image(&output, &cfg.output)
}

fn main() -> ExitCode {
    let cfg = match parse_args() {
        Ok(cfg) => cfg,
        Err(msg) => {
            println!("Error: {msg}");
            println!("Run with --help for usage.");
            return ExitCode::from(1);
        }
    };

    match run(&cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            println!("Error: {err}");
            ExitCode::from(1)
        }
    }
}
