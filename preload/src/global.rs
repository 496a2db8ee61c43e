use std::sync::atomic::{AtomicUsize, Ordering};

use crate::opt;
use crate::report;

const STATE_UNINITIALIZED: usize = 0;
const STATE_STARTING: usize = 1;
const STATE_READY: usize = 2;
const STATE_SHUTDOWN: usize = 3;

static STATE: AtomicUsize = AtomicUsize::new( STATE_UNINITIALIZED );

/// Whether hooks should track at all. The first call on any thread runs the
/// one-time startup; everything racing with it (including the allocations
/// the startup itself makes) passes through untracked.
#[inline(always)]
pub fn is_ready() -> bool {
    let state = STATE.load( Ordering::Relaxed );
    if state == STATE_READY {
        return true;
    }

    if state == STATE_UNINITIALIZED {
        return try_initialize();
    }

    false
}

#[cold]
#[inline(never)]
fn try_initialize() -> bool {
    if STATE.compare_exchange( STATE_UNINITIALIZED, STATE_STARTING, Ordering::SeqCst, Ordering::SeqCst ).is_err() {
        return false;
    }

    crate::init::startup();
    STATE.store( STATE_READY, Ordering::SeqCst );

    true
}

pub extern "C" fn on_exit() {
    if STATE.compare_exchange( STATE_READY, STATE_SHUTDOWN, Ordering::SeqCst, Ordering::SeqCst ).is_err() {
        return;
    }

    info!( "Exit hook called" );

    let opts = opt::get();
    report::dump( &opts.sort_keys, opts.flamegraph );

    info!( "Exit hook finished" );
}
