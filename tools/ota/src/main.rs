use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::{Body, Client};
use serde_json::Value;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_FIRMWARE: &str = "target/xtensa-esp32s3-espidf/release/esp2go.bin";

#[derive(Parser)]
#[command(name = "ota")]
#[command(about = "ESP2GO firmware update tool", long_about = None)]
struct Cli {
    /// Port number
    #[arg(short, long, default_value = "80", global = true)]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a firmware image straight into the device
    Upload {
        /// Device IP address
        ip: String,

        /// Firmware image to upload
        #[arg(short, long, default_value = DEFAULT_FIRMWARE)]
        firmware: PathBuf,

        /// Value for the X-OTA-Password header
        #[arg(long)]
        password: Option<String>,
    },
    /// Flash an image already stored on the device
    Flash {
        /// Device IP address
        ip: String,

        /// Image path on the device store
        #[arg(long, default_value = "/firmware.bin")]
        path: String,

        /// Expected SHA-256 of the stored image (hex)
        #[arg(long)]
        sha256: Option<String>,

        #[arg(long)]
        password: Option<String>,
    },
    /// Show update progress
    Status {
        ip: String,
    },
    /// List the modules the device published
    Modules {
        ip: String,
    },
}

/// Reader that advances a progress bar as the body is pulled.
struct ProgressReader<R> {
    inner: R,
    bar: ProgressBar,
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bar.inc(n as u64);
        if n == 0 {
            self.bar.set_message("waiting for device...");
        }
        Ok(n)
    }
}

fn client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("building HTTP client")
}

fn base_url(ip: &str, port: u16) -> String {
    format!("http://{}:{}", ip, port)
}

fn error_message(body: &Value) -> &str {
    body["error"]["message"].as_str().unwrap_or("unknown error")
}

fn parse_body(response: reqwest::blocking::Response) -> Result<(u16, Value)> {
    let status = response.status().as_u16();
    let text = response.text().context("reading response")?;
    let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
    Ok((status, body))
}

fn upload(base: &str, firmware: &PathBuf, password: Option<&str>) -> Result<()> {
    let file = File::open(firmware)
        .with_context(|| format!("firmware not found: {}", firmware.display()))?;
    let size = file.metadata()?.len();
    if size == 0 {
        bail!("firmware image {} is empty", firmware.display());
    }

    println!("{} ESP2GO firmware upload", "🚀".blue());
    println!("{}Device: {}", "   ".dimmed(), base);
    println!(
        "{}Firmware: {} bytes ({:.2} MB)",
        "   ".dimmed(),
        size,
        size as f64 / 1024.0 / 1024.0
    );

    let bar = ProgressBar::new(size);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
            .progress_chars("#>-"),
    );
    let reader = ProgressReader { inner: file, bar: bar.clone() };

    let mut request = client(Duration::from_secs(180))?
        .post(format!("{}/_api/ota/update", base))
        .header("Content-Type", "application/octet-stream")
        .header("Content-Length", size.to_string())
        .body(Body::sized(reader, size));
    if let Some(password) = password {
        request = request.header("X-OTA-Password", password);
    }

    let result = request.send();
    bar.finish_and_clear();
    let (status, body) = parse_body(result.context("upload failed")?)?;
    match status {
        200 => {
            println!("{} Upload successful! Device will restart.", "✅".green());
            Ok(())
        }
        401 | 403 => bail!("device rejected the OTA password ({})", status),
        409 => bail!("another update is already in progress"),
        413 => bail!("image larger than the update partition: {}", error_message(&body)),
        _ => bail!("upload failed: HTTP {}: {}", status, error_message(&body)),
    }
}

fn flash(base: &str, path: &str, sha256: Option<&str>, password: Option<&str>) -> Result<()> {
    let mut url = reqwest::Url::parse(&format!("{}/_api/ota/update", base))?;
    url.query_pairs_mut().append_pair("path", path);
    if let Some(digest) = sha256 {
        url.query_pairs_mut().append_pair("sha256", digest);
    }

    let mut request = client(Duration::from_secs(10))?.post(url);
    if let Some(password) = password {
        request = request.header("X-OTA-Password", password);
    }
    let (status, body) = parse_body(request.send().context("request failed")?)?;
    match status {
        200 => {
            println!("{} Update of {} scheduled; the device flashes on its next loop.", "✅".green(), path);
            Ok(())
        }
        404 => bail!("{} not found on the device", path),
        409 => bail!("another update is already in progress"),
        _ => bail!("flash failed: HTTP {}: {}", status, error_message(&body)),
    }
}

fn status(base: &str) -> Result<()> {
    let response = client(Duration::from_secs(5))?
        .get(format!("{}/_api/ota/status", base))
        .send()
        .context("device not reachable")?;
    let (code, body) = parse_body(response)?;
    if code != 200 {
        bail!("status failed: HTTP {}: {}", code, error_message(&body));
    }

    let state = body["state"].as_str().unwrap_or("unknown");
    let progress = body["progress"].as_u64().unwrap_or(0);
    let label = match state {
        "failed" => state.red(),
        "succeeded" => state.green(),
        "idle" => state.normal(),
        _ => state.yellow(),
    };
    println!("State:    {}", label);
    println!("Progress: {}%", progress);
    println!(
        "Written:  {} / {} bytes",
        body["bytes_written"].as_u64().unwrap_or(0),
        body["total_bytes"].as_u64().unwrap_or(0)
    );
    if let Some(error) = body["error"].as_str() {
        println!("Error:    {}", error.red());
    }
    Ok(())
}

fn modules(base: &str) -> Result<()> {
    let response = client(Duration::from_secs(5))?
        .get(format!("{}/_api/modules/list", base))
        .send()
        .context("device not reachable")?;
    let (code, body) = parse_body(response)?;
    if code != 200 {
        bail!("listing failed: HTTP {}", code);
    }

    let Some(list) = body["modules"].as_array() else {
        bail!("unexpected listing format");
    };
    println!("{} modules:", list.len().to_string().bold());
    for module in list {
        let ready = module["ready"].as_bool().unwrap_or(false);
        println!(
            "  {} {:<12} v{:<8} {}",
            if ready { "●".green() } else { "○".red() },
            module["name"].as_str().unwrap_or("?"),
            module["version"].as_str().unwrap_or("?"),
            module["description"].as_str().unwrap_or("").dimmed()
        );
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Upload { ip, firmware, password } => {
            upload(&base_url(ip, cli.port), firmware, password.as_deref())
        }
        Commands::Flash { ip, path, sha256, password } => flash(
            &base_url(ip, cli.port),
            path,
            sha256.as_deref(),
            password.as_deref(),
        ),
        Commands::Status { ip } => status(&base_url(ip, cli.port)),
        Commands::Modules { ip } => modules(&base_url(ip, cli.port)),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "❌".red(), e);
        std::process::exit(1);
    }
}
