use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use procrpc_peer::reactor::{self, Notice};
use procrpc_peer::{connector, CallError, Peer, PeerConfig, PeerError, PeerRef, Proxy};
use serde_json::Value;
use tracing::debug;

use crate::cmd::{parse_duration, CallArgs, Strategy};
use crate::exit::{call_error, peer_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_report, CallReport, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let call_args: Vec<Value> = args.args.iter().map(String::as_str).map(parse_arg).collect();

    let peer = match (&args.spawn, &args.connect) {
        (Some(command), _) => connector::spawn(command),
        (None, Some(address)) => {
            connector::connect_with_config(address, timeout, PeerConfig::default())
        }
        (None, None) => {
            return Err(CliError::new(USAGE, "either --spawn or --connect is required"));
        }
    }
    .map_err(|err| peer_error("connect failed", err))?
    .into_ref();

    let started = Instant::now();
    let result = dispatch(&peer, &args.method, call_args, args.strategy, timeout);
    let elapsed = started.elapsed();

    let peer_id = peer.borrow().id().to_string();
    if let Err(err) = peer.borrow_mut().close() {
        debug!(peer = %peer_id, error = %err, "close failed");
    }

    let value = result.map_err(|err| call_error("call failed", err))?;
    let mut report = CallReport::new(&args.method, &peer_id, args.strategy.name(), elapsed);
    if let Some(value) = value {
        report = report.with_result(value);
    }
    print_report(&report, format);
    Ok(SUCCESS)
}

/// Arguments are JSON where they parse as JSON, strings otherwise.
fn parse_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

fn dispatch(
    peer: &PeerRef,
    method: &str,
    args: Vec<Value>,
    strategy: Strategy,
    timeout: Duration,
) -> Result<Option<Value>, CallError> {
    match strategy {
        Strategy::Blocking => {
            let dispatched = Proxy::blocking_with_timeout(peer, timeout).call(method, args)?;
            Ok(dispatched.into_value())
        }
        Strategy::Background => {
            let proxy = Proxy::background(peer);
            let handle = proxy.call(method, args)?.handle().ok_or_else(|| {
                CallError::Peer(PeerError::Protocol("background call produced no handle".into()))
            })?;
            debug!(%handle, "waiting for background result");
            proxy.await_job(handle, Some(timeout)).map(Some)
        }
        Strategy::Callback => call_with_callback(peer, method, args, timeout).map(Some),
        Strategy::Ignore => {
            Proxy::ignore(peer).call(method, args)?;
            peer.borrow_mut().flush(Some(Instant::now() + timeout))?;
            Ok(None)
        }
    }
}

/// Send through a callback proxy and run the loop until the callback fires.
fn call_with_callback(
    peer: &PeerRef,
    method: &str,
    args: Vec<Value>,
    timeout: Duration,
) -> Result<Value, CallError> {
    let slot: Rc<RefCell<Option<Result<Value, CallError>>>> = Rc::default();
    let sink = Rc::clone(&slot);
    let proxy = Proxy::callback(peer, move |job, _peer| {
        *sink.borrow_mut() = Some(job.resolve());
    });
    proxy.call(method, args)?;

    let deadline = Instant::now() + timeout;
    let peers = [Rc::clone(peer)];
    loop {
        if let Some(result) = slot.borrow_mut().take() {
            return result;
        }
        if Instant::now() >= deadline {
            return Err(CallError::Timeout(timeout));
        }
        for notice in reactor::poll_once(&peers, &[], Some(deadline), Peer::dispatch)? {
            if let Notice::Closed { error, .. } = notice {
                return Err(CallError::Peer(error));
            }
        }
    }
}
