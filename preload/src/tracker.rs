use std::cell::RefCell;

use parking_lot::ReentrantMutex;

use crate::timestamp::{get_timestamp, Timestamp};
use crate::unwind::{Backtrace, CallSite};
use crate::utils::{empty_hashmap, Entry, HashMap};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SiteStats {
    pub count: u64,
    pub peak_count: u64,
    pub total_size: u64,
    pub peak_total_size: u64,
    pub depth: usize,
    pub birth: Timestamp,
    pub serial: u64
}

#[derive(Copy, Clone)]
struct LiveObject {
    site: CallSite,
    size: u64
}

pub struct TrackerState {
    sites: HashMap< CallSite, SiteStats >,
    live: HashMap< usize, LiveObject >,
    next_serial: u64
}

impl TrackerState {
    pub const fn new() -> Self {
        TrackerState {
            sites: empty_hashmap(),
            live: empty_hashmap(),
            next_serial: 0
        }
    }

    pub fn record( &mut self, address: usize, size: u64, backtrace: &Backtrace, now: Timestamp ) {
        if address == 0 {
            return;
        }

        // An address can come back from the allocator while we still hold a
        // record for it if its release went through an untracked path;
        // retiring the stale record first keeps the totals consistent.
        if self.live.contains_key( &address ) {
            self.release( address );
        }

        match self.sites.entry( backtrace.frames ) {
            Entry::Occupied( mut entry ) => {
                let stats = entry.get_mut();
                stats.count += 1;
                stats.total_size += size;
                stats.peak_count = stats.peak_count.max( stats.count );
                stats.peak_total_size = stats.peak_total_size.max( stats.total_size );
                stats.depth = backtrace.depth;
            },
            Entry::Vacant( entry ) => {
                entry.insert( SiteStats {
                    count: 1,
                    peak_count: 1,
                    total_size: size,
                    peak_total_size: size,
                    depth: backtrace.depth,
                    birth: now,
                    serial: self.next_serial
                });
                self.next_serial += 1;
            }
        }

        self.live.insert( address, LiveObject {
            site: backtrace.frames,
            size
        });
    }

    pub fn release( &mut self, address: usize ) {
        let object = match self.live.remove( &address ) {
            Some( object ) => object,
            None => return
        };

        let stats = match self.sites.get_mut( &object.site ) {
            Some( stats ) => stats,
            None => return
        };

        stats.count = stats.count.saturating_sub( 1 );
        stats.total_size = stats.total_size.saturating_sub( object.size );

        // Only call sites with live allocations are kept; the store's size
        // is bounded by what is currently outstanding, not by history.
        if stats.count == 0 {
            self.sites.remove( &object.site );
        }
    }

    pub fn clear( &mut self ) {
        self.sites.clear();
        self.live.clear();
    }

    pub fn snapshot( &self ) -> Vec< (CallSite, SiteStats) > {
        self.sites.iter().map( |(site, stats)| (*site, *stats) ).collect()
    }
}

// The same thread can re-enter through a signal handler delivered while the
// lock is held, so this must be a recursive lock. The nested `RefCell`
// borrow is then refused and the interrupted operation's state is left
// untouched; tracking failures are absorbed, never surfaced.
static TRACKER: ReentrantMutex< RefCell< TrackerState > > =
    parking_lot::const_reentrant_mutex( RefCell::new( TrackerState::new() ) );

pub fn record( address: usize, size: u64, backtrace: &Backtrace ) {
    let now = get_timestamp();
    let lock = TRACKER.lock();
    if let Ok( mut state ) = lock.try_borrow_mut() {
        state.record( address, size, backtrace, now );
    };
}

pub fn release( address: usize ) {
    let lock = TRACKER.lock();
    if let Ok( mut state ) = lock.try_borrow_mut() {
        state.release( address );
    };
}

pub fn clear() {
    let lock = TRACKER.lock();
    if let Ok( mut state ) = lock.try_borrow_mut() {
        state.clear();
    };
}

pub fn snapshot() -> Vec< (CallSite, SiteStats) > {
    let lock = TRACKER.lock();
    let result = match lock.try_borrow() {
        Ok( state ) => state.snapshot(),
        Err( _ ) => Vec::new()
    };
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unwind::MAX_STACK_DEPTH;

    fn site( id: usize ) -> Backtrace {
        let mut backtrace = Backtrace::empty();
        backtrace.frames[ 0 ] = id;
        backtrace.frames[ 1 ] = id + 0x1000;
        backtrace.depth = 2;
        backtrace
    }

    fn now() -> Timestamp {
        Timestamp::from_nsecs( 0 )
    }

    fn totals( state: &TrackerState ) -> (u64, u64) {
        state.snapshot().iter().fold( (0, 0), |(count, size), (_, stats)| {
            (count + stats.count, size + stats.total_size)
        })
    }

    #[test]
    fn test_conservation_across_interleaved_calls() {
        let mut state = TrackerState::new();
        state.record( 0x100, 10, &site( 1 ), now() );
        state.record( 0x200, 20, &site( 1 ), now() );
        state.record( 0x300, 30, &site( 2 ), now() );
        assert_eq!( totals( &state ), (3, 60) );

        state.release( 0x200 );
        assert_eq!( totals( &state ), (2, 40) );

        state.record( 0x400, 5, &site( 2 ), now() );
        assert_eq!( totals( &state ), (3, 45) );

        state.release( 0x100 );
        state.release( 0x300 );
        state.release( 0x400 );
        assert_eq!( totals( &state ), (0, 0) );
    }

    #[test]
    fn test_peaks_are_monotonic_and_bound_current_values() {
        let mut state = TrackerState::new();
        state.record( 0x100, 100, &site( 1 ), now() );
        state.record( 0x200, 100, &site( 1 ), now() );
        state.release( 0x100 );
        state.record( 0x300, 50, &site( 1 ), now() );

        let snapshot = state.snapshot();
        let (_, stats) = snapshot[ 0 ];
        assert_eq!( stats.count, 2 );
        assert_eq!( stats.peak_count, 2 );
        assert_eq!( stats.total_size, 150 );
        assert_eq!( stats.peak_total_size, 200 );
        assert!( stats.peak_count >= stats.count );
        assert!( stats.peak_total_size >= stats.total_size );
    }

    #[test]
    fn test_site_is_pruned_when_count_reaches_zero() {
        let mut state = TrackerState::new();
        state.record( 0x100, 10, &site( 1 ), now() );
        state.record( 0x200, 10, &site( 2 ), now() );

        state.release( 0x100 );
        let snapshot = state.snapshot();
        assert_eq!( snapshot.len(), 1 );
        assert_eq!( snapshot[ 0 ].0, site( 2 ).frames );
    }

    #[test]
    fn test_release_of_unknown_address_is_a_no_op() {
        let mut state = TrackerState::new();
        state.record( 0x100, 10, &site( 1 ), now() );
        state.release( 0xdead );
        state.release( 0xdead );
        assert_eq!( totals( &state ), (1, 10) );
    }

    #[test]
    fn test_double_release_is_a_no_op() {
        let mut state = TrackerState::new();
        state.record( 0x100, 10, &site( 1 ), now() );
        state.release( 0x100 );
        state.release( 0x100 );
        assert_eq!( totals( &state ), (0, 0) );
    }

    #[test]
    fn test_null_address_is_not_recorded() {
        let mut state = TrackerState::new();
        state.record( 0, 10, &site( 1 ), now() );
        assert!( state.snapshot().is_empty() );
    }

    #[test]
    fn test_resize_moves_accounting_between_sites() {
        // A resize is a release of the old address followed by a record at
        // the resize call site; at no point do both sizes count at once.
        let mut state = TrackerState::new();
        state.record( 0xa00, 10, &site( 1 ), now() );

        state.release( 0xa00 );
        state.record( 0xb00, 1000, &site( 2 ), now() );

        let snapshot = state.snapshot();
        assert_eq!( snapshot.len(), 1 );
        let (frames, stats) = snapshot[ 0 ];
        assert_eq!( frames, site( 2 ).frames );
        assert_eq!( stats.total_size, 1000 );
        assert_eq!( totals( &state ), (1, 1000) );
    }

    #[test]
    fn test_address_reuse_overwrites_the_stale_record() {
        let mut state = TrackerState::new();
        state.record( 0x100, 10, &site( 1 ), now() );
        // The same address comes back without an observed release.
        state.record( 0x100, 30, &site( 2 ), now() );
        assert_eq!( totals( &state ), (1, 30) );

        state.release( 0x100 );
        assert_eq!( totals( &state ), (0, 0) );
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut state = TrackerState::new();
        state.record( 0x100, 10, &site( 1 ), now() );
        state.clear();
        assert!( state.snapshot().is_empty() );
        state.clear();
        assert!( state.snapshot().is_empty() );
    }

    #[test]
    fn test_serials_follow_insertion_order() {
        let mut state = TrackerState::new();
        state.record( 0x100, 10, &site( 3 ), now() );
        state.record( 0x200, 10, &site( 1 ), now() );
        state.record( 0x300, 10, &site( 2 ), now() );

        let mut snapshot = state.snapshot();
        snapshot.sort_by_key( |(_, stats)| stats.serial );
        assert_eq!( snapshot[ 0 ].0, site( 3 ).frames );
        assert_eq!( snapshot[ 1 ].0, site( 1 ).frames );
        assert_eq!( snapshot[ 2 ].0, site( 2 ).frames );
    }

    #[test]
    fn test_depth_shallower_than_bound_is_preserved() {
        let mut state = TrackerState::new();
        let mut shallow = Backtrace::empty();
        shallow.frames[ 0 ] = 0x42;
        shallow.depth = 1;
        state.record( 0x100, 10, &shallow, now() );

        let snapshot = state.snapshot();
        assert_eq!( snapshot[ 0 ].1.depth, 1 );
        assert!( snapshot[ 0 ].1.depth < MAX_STACK_DEPTH );
    }
}
