use std::mem::transmute;

use libc::{c_int, c_void, uintptr_t};

/// How many return addresses make up an aggregation key. Chains deeper than
/// this alias onto the same key; in particular direct recursion deeper than
/// the bound collapses onto a single call site.
pub const MAX_STACK_DEPTH: usize = 8;

// The capture always starts with `grab` itself and the hook that called it;
// neither belongs to the traced program.
const SKIP_FRAMES: usize = 2;

/// A bounded, zero-padded chain of return addresses; the aggregation key.
pub type CallSite = [usize; MAX_STACK_DEPTH];

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Backtrace {
    pub frames: CallSite,
    pub depth: usize
}

impl Backtrace {
    pub const fn empty() -> Self {
        Backtrace {
            frames: [0; MAX_STACK_DEPTH],
            depth: 0
        }
    }

    pub fn is_empty( &self ) -> bool {
        self.depth == 0
    }
}

type Context = *mut c_void;
type ReasonCode = c_int;
type Callback = extern "C" fn( Context, *mut c_void ) -> ReasonCode;

extern "C" {
    fn _Unwind_Backtrace( callback: Callback, data: *mut c_void ) -> ReasonCode;
    fn _Unwind_GetIP( context: Context ) -> uintptr_t;
}

const URC_NO_REASON: ReasonCode = 0;
const URC_NORMAL_STOP: ReasonCode = 4;

struct CaptureState {
    backtrace: Backtrace,
    skipped: usize
}

extern "C" fn on_frame( context: Context, data: *mut c_void ) -> ReasonCode {
    let state: &mut CaptureState = unsafe { transmute( data ) };

    if state.skipped < SKIP_FRAMES {
        state.skipped += 1;
        return URC_NO_REASON;
    }

    let address = unsafe { _Unwind_GetIP( context ) } as usize;
    if address == 0 {
        return URC_NO_REASON;
    }

    state.backtrace.frames[ state.backtrace.depth ] = address;
    state.backtrace.depth += 1;

    if state.backtrace.depth >= MAX_STACK_DEPTH {
        URC_NORMAL_STOP
    } else {
        URC_NO_REASON
    }
}

/// Captures the current caller chain, newest frame first.
#[inline(never)]
pub fn grab() -> Backtrace {
    let mut state = CaptureState {
        backtrace: Backtrace::empty(),
        skipped: 0
    };

    unsafe {
        _Unwind_Backtrace( on_frame, &mut state as *mut CaptureState as *mut c_void );
    }

    state.backtrace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn capture_at_depth( depth: usize ) -> Backtrace {
        if depth == 0 {
            let backtrace = grab();
            backtrace
        } else {
            let backtrace = capture_at_depth( depth - 1 );
            backtrace
        }
    }

    #[test]
    fn test_capture_is_bounded_and_non_empty() {
        let backtrace = capture_at_depth( 0 );
        assert!( backtrace.depth > 0 );
        assert!( backtrace.depth <= MAX_STACK_DEPTH );
        for &frame in &backtrace.frames[ ..backtrace.depth ] {
            assert_ne!( frame, 0 );
        }
        for &frame in &backtrace.frames[ backtrace.depth.. ] {
            assert_eq!( frame, 0 );
        }
    }

    #[test]
    fn test_deep_recursion_collapses_onto_one_key() {
        // Both captures happen beyond the depth bound, so every recorded
        // frame is the same recursive call instruction and the keys match.
        let first = capture_at_depth( MAX_STACK_DEPTH + 4 );
        let second = capture_at_depth( MAX_STACK_DEPTH + 9 );
        assert_eq!( first.depth, MAX_STACK_DEPTH );
        assert_eq!( first.frames, second.frames );
    }
}
