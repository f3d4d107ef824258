use std::env;
use std::fmt;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use mailtask_proto::{
    Header, KIND_HEALTH, KIND_HEALTH_REPORT, KIND_PING, decode_header_json,
    encode_header_json, read_ack_async, read_frame_async, write_frame_async,
};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};

const MAX_HEADER_LEN: u32 = 16 * 1024;
const MAX_BODY_LEN: u64 = 4 * 1024 * 1024;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let args = Args::parse(env::args().skip(1))?;

    let probe = timeout(Duration::from_secs(args.timeout_secs), run_probe(&args))
        .await
        .with_context(|| {
            format!("health probe timed out after {}s: {}", args.timeout_secs, args)
        })??;

    Ok(probe)
}

async fn run_probe(args: &Args) -> Result<ExitCode> {
    let mut stream = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("connect failed: addr={}", args.addr))?;

    let kind = if args.ping { KIND_PING } else { KIND_HEALTH };
    let header = encode_header_json(&Header::new(kind).with_source("health_probe"))
        .context("failed to encode request header")?;
    write_frame_async(&mut stream, &header, &[])
        .await
        .context("failed to send request")?;

    if args.ping {
        read_ack_async(&mut stream).await.context("no ACK for ping")?;
        println!("pong addr={}", args.addr);
        return Ok(ExitCode::SUCCESS);
    }

    let (reply_header, body) =
        read_frame_async(&mut stream, MAX_HEADER_LEN, MAX_BODY_LEN)
            .await
            .context("failed to read health report")?;
    let reply_header =
        decode_header_json(&reply_header).context("failed to decode reply header")?;
    if !reply_header.is_kind(KIND_HEALTH_REPORT) {
        bail!("unexpected reply kind: {}", reply_header.kind);
    }

    let report: serde_json::Value =
        serde_json::from_slice(&body).context("health report is not JSON")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to render report")?
    );

    if is_ready(&report) {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!(
            "not ready: state={}, connection_healthy={}",
            report["state"].as_str().unwrap_or("-"),
            report["connection"]["healthy"].as_bool().unwrap_or(false)
        );
        Ok(ExitCode::FAILURE)
    }
}

fn is_ready(report: &serde_json::Value) -> bool {
    report.get("ready").and_then(serde_json::Value::as_bool).unwrap_or(false)
}

#[derive(Debug, Clone)]
struct Args {
    addr: String,
    timeout_secs: u64,
    ping: bool,
}

impl Args {
    fn parse<I>(mut it: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut addr = "127.0.0.1:2148".to_string();
        let mut timeout_secs = 5u64;
        let mut ping = false;

        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--addr" => {
                    addr = it.next().context("missing value for --addr")?;
                }
                "--timeout" => {
                    let raw = it.next().context("missing value for --timeout")?;
                    timeout_secs =
                        raw.parse::<u64>().context("invalid --timeout value")?;
                }
                "--ping" => ping = true,
                "-h" | "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(anyhow::anyhow!("unknown argument: {arg}")),
            }
        }

        Ok(Self { addr, timeout_secs: timeout_secs.max(1), ping })
    }
}

fn print_usage() {
    eprintln!("usage: health_probe [--addr 127.0.0.1:2148] [--timeout 5] [--ping]");
}

impl fmt::Display for Args {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            f,
            "addr={}, timeout_secs={}, ping={}",
            self.addr, self.timeout_secs, self.ping
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Args, is_ready};

    fn args(raw: &[&str]) -> anyhow::Result<Args> {
        Args::parse(raw.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn defaults_target_local_listener() {
        let parsed = args(&[]).unwrap();
        assert_eq!(parsed.addr, "127.0.0.1:2148");
        assert_eq!(parsed.timeout_secs, 5);
        assert!(!parsed.ping);
    }

    #[test]
    fn parses_flags_and_rejects_unknown() {
        let parsed = args(&["--addr", "10.0.0.2:9100", "--timeout", "0", "--ping"]).unwrap();
        assert_eq!(parsed.addr, "10.0.0.2:9100");
        assert_eq!(parsed.timeout_secs, 1);
        assert!(parsed.ping);

        assert!(args(&["--verbose"]).is_err());
        assert!(args(&["--timeout", "soon"]).is_err());
    }

    #[test]
    fn readiness_comes_from_report_flag() {
        assert!(is_ready(&serde_json::json!({ "ready": true })));
        assert!(!is_ready(&serde_json::json!({ "ready": false })));
        assert!(!is_ready(&serde_json::json!({ "state": "running" })));
    }
}
