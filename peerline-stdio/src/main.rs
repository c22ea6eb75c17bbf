//! peerline-stdio: a peer on stdin/stdout serving a few built-in operations.
//!
//! Handy for poking at the line format by hand:
//!
//! ```text
//! $ echo '["add",[2,3],1]' | peerline-stdio
//! [[null,5],1]
//! ```

use std::process;

use anyhow::Context;
use peerline::{
    DEFAULT_MAX_LINE_LENGTH, HandlerMap, NameTemplate, OperationError, Peer, PeerConfig,
    VersionInfo,
};
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

struct Options {
    template: NameTemplate,
    max_line_length: usize,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: peerline-stdio [--namespace <template>] [--max-line-length <bytes>]");
            eprintln!();
            eprintln!("Serves ping, echo, add and version over stdin/stdout.");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --namespace <template>     Map incoming names through a template, e.g. 'demo_{{}}'");
            eprintln!(
                "  --max-line-length <bytes>  Longest accepted line [default: {DEFAULT_MAX_LINE_LENGTH}]"
            );
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(options) {
        tracing::error!(error = %e, "peerline-stdio failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        template: NameTemplate::identity(),
        max_line_length: DEFAULT_MAX_LINE_LENGTH,
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--namespace" => {
                i += 1;
                let raw = args.get(i).ok_or("--namespace requires a value")?;
                options.template = raw.parse().map_err(|e| format!("{e}"))?;
            }
            "--max-line-length" => {
                i += 1;
                let raw = args.get(i).ok_or("--max-line-length requires a value")?;
                options.max_line_length = match raw.parse::<usize>() {
                    Ok(n) if n > 0 => n,
                    _ => return Err(format!("invalid line length '{raw}'")),
                };
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(options)
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PEERLINE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("peerline={level},peerline_stdio={level}"))
    };

    // stdout carries the protocol, so logs always go to stderr.
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

#[tokio::main]
async fn run(options: Options) -> anyhow::Result<()> {
    let handlers = builtin_operations(&options.template);
    let config = PeerConfig::new()
        .with_template(options.template)
        .with_max_line_length(options.max_line_length);

    let peer = Peer::stdio(handlers, config).context("failed to start peer")?;
    tracing::info!(version = peerline::PEERLINE_VERSION, "Serving on stdin/stdout");

    peer.wait().await.context("listener failed")?;
    tracing::info!(state = peer.state().as_str(), "Peer finished");
    Ok(())
}

/// Operations are registered under their templated names, so incoming
/// `ping` reaches `demo_ping` when running with `--namespace demo_{}`.
fn builtin_operations(template: &NameTemplate) -> HandlerMap {
    HandlerMap::new()
        .with(template.apply("ping"), |_| Ok(json!("pong")))
        .with(template.apply("echo"), |args| Ok(Value::Array(args)))
        .with(template.apply("add"), add)
        .with(template.apply("version"), |_| {
            Ok(serde_json::to_value(
                VersionInfo::new().with_application(concat!(
                    "peerline-stdio ",
                    env!("CARGO_PKG_VERSION")
                )),
            )?)
        })
}

/// Sums numeric arguments. Integer-only input yields an integer.
fn add(args: Vec<Value>) -> Result<Value, OperationError> {
    if args.iter().all(|v| v.is_i64()) {
        let mut sum: i64 = 0;
        for v in &args {
            let n = v.as_i64().unwrap_or_default();
            sum = sum
                .checked_add(n)
                .ok_or_else(|| OperationError::new("integer overflow"))?;
        }
        return Ok(json!(sum));
    }

    let mut sum = 0.0;
    for (index, v) in args.iter().enumerate() {
        sum += v.as_f64().ok_or_else(|| {
            OperationError::new(format!("argument {index} is not a number"))
                .with_field("index", index)
        })?;
    }
    Ok(json!(sum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerline::{Operation, Provider};

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("peerline-stdio")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_args_defaults() {
        let options = parse_args(&args(&[])).unwrap();
        assert!(options.template.is_identity());
        assert_eq!(options.max_line_length, DEFAULT_MAX_LINE_LENGTH);
    }

    #[test]
    fn parse_args_flags() {
        let options =
            parse_args(&args(&["--namespace", "demo_{}", "--max-line-length", "4096"])).unwrap();
        assert_eq!(options.template.apply("ping"), "demo_ping");
        assert_eq!(options.max_line_length, 4096);
    }

    #[test]
    fn parse_args_rejects_bad_input() {
        assert!(parse_args(&args(&["--namespace"])).is_err());
        assert!(parse_args(&args(&["--namespace", "no_slot"])).is_err());
        assert!(parse_args(&args(&["--max-line-length", "0"])).is_err());
        assert!(parse_args(&args(&["--max-line-length", "lots"])).is_err());
        assert!(parse_args(&args(&["extra"])).is_err());
        assert_eq!(parse_args(&args(&["--help"])).err().unwrap(), "");
    }

    #[test]
    fn add_keeps_integers_integral() {
        assert_eq!(add(vec![json!(2), json!(3)]).unwrap(), json!(5));
        assert_eq!(add(vec![]).unwrap(), json!(0));
        assert_eq!(add(vec![json!(1), json!(0.5)]).unwrap(), json!(1.5));
    }

    #[test]
    fn add_rejects_non_numbers() {
        let err = add(vec![json!(1), json!("two")]).unwrap_err();
        assert_eq!(err.message(), "argument 1 is not a number");
        assert_eq!(err.fields().get("index"), Some(&json!(1)));
        assert!(add(vec![json!(i64::MAX), json!(1)]).is_err());
    }

    #[test]
    fn builtins_follow_the_template() {
        let template: NameTemplate = "demo_{}".parse().unwrap();
        let handlers = builtin_operations(&template);
        assert!(handlers.contains("demo_ping"));
        assert!(handlers.contains("demo_version"));
        assert!(handlers.lookup("ping").is_none());

        let pong = handlers.lookup("demo_ping").unwrap().invoke(vec![]).unwrap();
        assert_eq!(pong, json!("pong"));
    }

    #[test]
    fn version_reports_the_application() {
        let handlers = builtin_operations(&NameTemplate::identity());
        let info = handlers.lookup("version").unwrap().invoke(vec![]).unwrap();
        assert_eq!(info["peerline"], json!(peerline::PEERLINE_VERSION));
        assert_eq!(info["protocol"], json!(peerline::PROTOCOL_REVISION));
        assert!(info["application"].as_str().unwrap().starts_with("peerline-stdio "));
    }
}
