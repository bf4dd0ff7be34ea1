use std::sync::Arc;

use arrrg::CommandLine;

use zerror::Z;

use replicant::daemon::{Daemon, DaemonOptions, Signals};
use replicant::transport::TcpTransport;
use replicant::COLLECTOR;

fn daemonize() {
    // SAFETY(rescrv):  fork and setsid before any thread exists.
    unsafe {
        let pid = libc::fork();
        if pid < 0 {
            eprintln!("could not fork: {}", std::io::Error::last_os_error());
            std::process::exit(1);
        }
        if pid > 0 {
            std::process::exit(0);
        }
        libc::setsid();
    }
}

fn main() {
    minimal_signals::block();
    let (options, free) =
        DaemonOptions::from_command_line_relaxed("USAGE: replicant-daemon [OPTIONS]");
    if !free.is_empty() {
        eprintln!("command takes no positional arguments");
        std::process::exit(1);
    }
    if options.daemon && !options.foreground {
        daemonize();
    }
    COLLECTOR.register(indicio::stdio::StdioEmitter);
    COLLECTOR.set_verbosity(indicio::INFO);
    let signals = Arc::new(Signals::new());
    let watcher_signals = Arc::clone(&signals);
    std::thread::spawn(move || {
        loop {
            let set = minimal_signals::SignalSet::new()
                .add(minimal_signals::SIGHUP)
                .add(minimal_signals::SIGINT)
                .add(minimal_signals::SIGQUIT)
                .add(minimal_signals::SIGTERM)
                .add(minimal_signals::SIGUSR1)
                .add(minimal_signals::SIGUSR2);
            let Some(signal) = minimal_signals::wait(set) else {
                continue;
            };
            if signal == minimal_signals::SIGUSR1 {
                watcher_signals.request_debug_dump();
            } else if signal == minimal_signals::SIGUSR2 {
                let verbosity = if COLLECTOR.verbosity() >= indicio::TRACING {
                    indicio::INFO
                } else {
                    indicio::TRACING
                };
                COLLECTOR.set_verbosity(verbosity);
            } else {
                watcher_signals.interrupt();
                break;
            }
        }
    });
    let result = Daemon::run(options, signals, |us| {
        Ok(Arc::new(TcpTransport::new(us.clone())?))
    });
    match result {
        Ok(()) => {}
        Err(err) => {
            eprintln!("{}", err.long_form());
            std::process::exit(1);
        }
    }
}
