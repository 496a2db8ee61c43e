use libc;

/// A monotonic timestamp, in nanoseconds since an arbitrary epoch.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Timestamp( u64 );

impl Timestamp {
    pub const fn from_nsecs( nsecs: u64 ) -> Self {
        Timestamp( nsecs )
    }

    pub fn from_timespec( sec: u64, nsec: u64 ) -> Self {
        Timestamp( sec * 1_000_000_000 + nsec )
    }

    pub fn as_nsecs( self ) -> u64 {
        self.0
    }

    /// Nanoseconds elapsed since `earlier`; zero if `earlier` is in the future.
    pub fn elapsed_since( self, earlier: Timestamp ) -> u64 {
        self.0.saturating_sub( earlier.0 )
    }
}

pub fn get_timestamp() -> Timestamp {
    let mut timespec = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0
    };

    unsafe {
        libc::clock_gettime( libc::CLOCK_MONOTONIC, &mut timespec );
    }

    Timestamp::from_timespec( timespec.tv_sec as u64, timespec.tv_nsec as u64 )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_since() {
        let earlier = Timestamp::from_nsecs( 1_000 );
        let later = Timestamp::from_nsecs( 3_500 );
        assert_eq!( later.elapsed_since( earlier ), 2_500 );
        assert_eq!( earlier.elapsed_since( later ), 0 );
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let first = get_timestamp();
        let second = get_timestamp();
        assert!( second >= first );
    }
}
