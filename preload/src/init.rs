use std::env;

use crate::global::on_exit;
use crate::logger;
use crate::opt::{self, SortKey};
use crate::output;
use crate::report;
use crate::resolver;

fn initialize_logger() {
    static mut SYSCALL_LOGGER: logger::SyscallLogger = logger::SyscallLogger::empty();
    let log_level = if let Ok( value ) = env::var( "HEAPSCOPE_LOG" ) {
        match value.as_str() {
            "trace" => log::LevelFilter::Trace,
            "debug" => log::LevelFilter::Debug,
            "info" => log::LevelFilter::Info,
            "warn" => log::LevelFilter::Warn,
            "error" => log::LevelFilter::Error,
            _ => log::LevelFilter::Off
        }
    } else {
        log::LevelFilter::Off
    };

    unsafe {
        SYSCALL_LOGGER.initialize( log_level, *crate::PID );
        let _ = log::set_logger( &SYSCALL_LOGGER );
    }

    log::set_max_level( log_level );
}

fn initialize_atexit_hook() {
    info!( "Setting atexit hook..." );
    unsafe {
        let result = libc::atexit( on_exit );
        if result != 0 {
            error!( "Cannot set the at-exit hook" );
        }
    }
}

fn initialize_signal_handlers() {
    extern "C" fn sigusr1_handler( _: libc::c_int ) {
        debug!( "SIGUSR1 received" );
        report::dump_by( SortKey::Size );
    }

    extern "C" fn sigusr2_handler( _: libc::c_int ) {
        debug!( "SIGUSR2 received" );
        report::dump_by( SortKey::Count );
    }

    extern "C" fn sigquit_handler( _: libc::c_int ) {
        debug!( "SIGQUIT received" );
        report::clear();
    }

    info!( "Registering SIGUSR1/SIGUSR2/SIGQUIT handlers..." );
    unsafe {
        libc::signal( libc::SIGUSR1, sigusr1_handler as libc::sighandler_t );
        libc::signal( libc::SIGUSR2, sigusr2_handler as libc::sighandler_t );
        libc::signal( libc::SIGQUIT, sigquit_handler as libc::sighandler_t );
    }
}

/// One-shot process initialization, run lazily off the first hooked call.
/// Every allocation made in here happens while the engine is still in its
/// starting state, so it passes straight through to the real allocator.
pub fn startup() {
    initialize_logger();
    info!( "Version: {}", env!( "CARGO_PKG_VERSION" ) );

    unsafe {
        opt::initialize();
        resolver::initialize();
    }

    output::initialize();
    initialize_atexit_hook();
    initialize_signal_handlers();

    info!( "Startup initialization finished" );
}
