use std::cell::Cell;

use crate::global;

thread_local! {
    // Set while a hook is doing its own bookkeeping; any allocation made
    // during that window must go straight to the real allocator, otherwise
    // recording an allocation would recurse into recording forever.
    static GUARD: Cell< bool > = const { Cell::new( false ) };
}

/// Entered at the top of every hook; released when the hook returns.
///
/// `enter` refuses (and the caller falls back to a plain pass-through call)
/// when the engine isn't fully initialized yet, when this thread is already
/// inside a hook, or when the thread is being torn down and its TLS is gone.
pub struct HookGuard {
    _not_send: std::marker::PhantomData< *mut () >
}

impl HookGuard {
    #[inline(always)]
    pub fn enter() -> Option< Self > {
        if !global::is_ready() {
            return None;
        }

        let entered = GUARD.try_with( |guard| {
            if guard.get() {
                false
            } else {
                guard.set( true );
                true
            }
        }).unwrap_or( false );

        if entered {
            Some( HookGuard { _not_send: std::marker::PhantomData } )
        } else {
            None
        }
    }
}

impl Drop for HookGuard {
    #[inline]
    fn drop( &mut self ) {
        let _ = GUARD.try_with( |guard| guard.set( false ) );
    }
}

/// Forces the guard on for the duration of a scope, restoring the previous
/// value afterwards. Used by the reporting and reset paths, which must keep
/// their own formatting allocations out of the statistics no matter which
/// context they were invoked from.
pub struct ScopedGuard {
    previous: bool
}

impl ScopedGuard {
    pub fn enter() -> Self {
        let previous = GUARD.try_with( |guard| {
            let previous = guard.get();
            guard.set( true );
            previous
        }).unwrap_or( true );

        ScopedGuard { previous }
    }
}

impl Drop for ScopedGuard {
    fn drop( &mut self ) {
        let previous = self.previous;
        let _ = GUARD.try_with( |guard| guard.set( previous ) );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_guard_restores_previous_value() {
        let outer = ScopedGuard::enter();
        {
            let _inner = ScopedGuard::enter();
            assert!( GUARD.with( |guard| guard.get() ) );
        }
        assert!( GUARD.with( |guard| guard.get() ) );
        drop( outer );
        assert!( !GUARD.with( |guard| guard.get() ) );
    }
}
