use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use procrpc_peer::output;
use procrpc_peer::{
    connector, method, LoopExit, Master, Method, Peer, PeerConfig, RemoteError,
};
use serde_json::{json, Value};
use tracing::info;

use crate::cmd::WorkerArgs;
use crate::exit::{peer_error, CliError, CliResult, INTERNAL, SUCCESS};

/// How long one loop slice runs before the interrupt flag is checked.
const SLICE: Duration = Duration::from_millis(250);

pub fn run(args: WorkerArgs) -> CliResult<i32> {
    let config = PeerConfig {
        max_buffer: args.max_buffer,
        ..PeerConfig::default()
    };
    match args.listen {
        Some(address) => serve_tcp(&address, config),
        None => serve_stdio(config),
    }
}

fn serve_stdio(config: PeerConfig) -> CliResult<i32> {
    let peer = connector::stdio_with_config(config).into_ref();
    peer.borrow_mut()
        .add_methods(demo_methods())
        .map_err(|err| peer_error("announce failed", err))?;
    info!(pid = std::process::id(), "serving over stdio");
    Peer::serve(&peer).map_err(|err| peer_error("serve failed", err))?;
    Ok(SUCCESS)
}

fn serve_tcp(address: &str, config: PeerConfig) -> CliResult<i32> {
    let mut master = Master::new().with_peer_config(config);
    master
        .add_methods(demo_methods())
        .map_err(|err| peer_error("method setup failed", err))?;

    let reactor = master.reactor();
    master
        .add_method(
            "shutdown",
            method(move |_| {
                reactor.stop(Value::Null);
                Ok(Value::Null)
            }),
        )
        .map_err(|err| peer_error("method setup failed", err))?;

    let local = master
        .listen(address)
        .map_err(|err| peer_error("listen failed", err))?;
    info!(address = %local, "worker listening");
    println!("{}", json!({ "listening": local.to_string() }));

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    while running.load(Ordering::SeqCst) {
        let exit = master
            .run_until(Instant::now() + SLICE)
            .map_err(|err| peer_error("event loop failed", err))?;
        if let LoopExit::Stopped(_) = exit {
            info!("shutdown requested");
            break;
        }
    }
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

fn int_arg(args: &[Value], index: usize) -> Result<i64, RemoteError> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| RemoteError::failed(format!("argument {index} must be an integer")))
}

/// Methods every worker offers.
pub fn demo_methods() -> Vec<(String, Method)> {
    vec![
        (
            "double".to_string(),
            method(|args| Ok(json!(int_arg(args, 0)? * 2))),
        ),
        (
            "add".to_string(),
            method(|args| {
                let mut total = 0.0;
                for (index, arg) in args.iter().enumerate() {
                    total += arg.as_f64().ok_or_else(|| {
                        RemoteError::failed(format!("argument {index} must be a number"))
                    })?;
                }
                if args.iter().all(Value::is_i64) {
                    Ok(json!(total as i64))
                } else {
                    Ok(json!(total))
                }
            }),
        ),
        (
            "echo".to_string(),
            method(|args| Ok(Value::Array(args.to_vec()))),
        ),
        (
            "greet".to_string(),
            method(|args| {
                let name = args.first().and_then(Value::as_str).unwrap_or("world");
                let greeting = format!("hello {name}");
                output::print(&format!("{greeting}\n"));
                Ok(json!(greeting))
            }),
        ),
        (
            "sleep".to_string(),
            method(|args| {
                let ms = int_arg(args, 0)?.max(0) as u64;
                std::thread::sleep(Duration::from_millis(ms));
                Ok(json!(ms))
            }),
        ),
        (
            "fail".to_string(),
            method(|args| {
                let message = args.first().and_then(Value::as_str).unwrap_or("failed on request");
                Err(RemoteError::failed(message))
            }),
        ),
        (
            "panic".to_string(),
            method(|_| panic!("panicked on request")),
        ),
        (
            "pid".to_string(),
            method(|_| Ok(json!(std::process::id()))),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use procrpc_peer::{MethodRegistry, RemoteErrorKind};

    fn registry() -> MethodRegistry {
        let mut registry = MethodRegistry::new();
        registry.register_all(demo_methods());
        registry
    }

    #[test]
    fn double_and_add() {
        let registry = registry();
        assert_eq!(registry.invoke("double", &[json!(21)]).unwrap(), json!(42));
        assert_eq!(
            registry.invoke("add", &[json!(1), json!(2), json!(3)]).unwrap(),
            json!(6)
        );
        assert_eq!(
            registry.invoke("add", &[json!(1), json!(0.5)]).unwrap(),
            json!(1.5)
        );
    }

    #[test]
    fn bad_arguments_are_remote_failures() {
        let err = registry()
            .invoke("double", &[json!("x")])
            .expect_err("string is not an integer");
        assert_eq!(err.kind, RemoteErrorKind::Failed);
    }

    #[test]
    fn fail_uses_given_message() {
        let err = registry()
            .invoke("fail", &[json!("boom")])
            .expect_err("fail should fail");
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn echo_returns_arguments() {
        assert_eq!(
            registry().invoke("echo", &[json!(1), json!("a")]).unwrap(),
            json!([1, "a"])
        );
    }
}
