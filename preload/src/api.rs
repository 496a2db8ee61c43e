use std::ptr;

use libc::{
    c_int,
    c_void,
    off_t,
    size_t
};

use crate::resolver;
use crate::tls::HookGuard;
use crate::tracker;
use crate::unwind;

#[inline(always)]
unsafe fn track_allocation( address: *mut c_void, size: usize ) {
    if address.is_null() {
        return;
    }

    let backtrace = unwind::grab();
    tracker::record( address as usize, size as u64, &backtrace );
}

#[inline(always)]
unsafe fn track_release( address: *mut c_void ) {
    if address.is_null() {
        return;
    }

    tracker::release( address as usize );
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn malloc( size: size_t ) -> *mut c_void {
    let _guard = match HookGuard::enter() {
        Some( guard ) => guard,
        None => return resolver::malloc( size )
    };

    let ptr = resolver::malloc( size );
    track_allocation( ptr, size as usize );
    ptr
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn calloc( count: size_t, element_size: size_t ) -> *mut c_void {
    let _guard = match HookGuard::enter() {
        Some( guard ) => guard,
        None => return resolver::calloc( count, element_size )
    };

    let ptr = resolver::calloc( count, element_size );
    track_allocation( ptr, (count as usize).wrapping_mul( element_size as usize ) );
    ptr
}

#[inline(always)]
unsafe fn realloc_impl( old_ptr: *mut c_void, size: size_t ) -> *mut c_void {
    let _guard = match HookGuard::enter() {
        Some( guard ) => guard,
        None => return resolver::realloc( old_ptr, size )
    };

    let new_ptr = resolver::realloc( old_ptr, size );

    // A resize is a release of the old address followed by a fresh record
    // at the resize call site, even when the allocator kept the address.
    // On failure (null result for a non-zero size) the old block is still
    // live and nothing changes.
    if !old_ptr.is_null() && (!new_ptr.is_null() || size == 0) {
        track_release( old_ptr );
    }
    track_allocation( new_ptr, size as usize );

    new_ptr
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn realloc( old_ptr: *mut c_void, size: size_t ) -> *mut c_void {
    realloc_impl( old_ptr, size )
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn reallocarray( old_ptr: *mut c_void, count: size_t, element_size: size_t ) -> *mut c_void {
    let size = match (count as usize).checked_mul( element_size as usize ) {
        None => {
            *libc::__errno_location() = libc::ENOMEM;
            return ptr::null_mut()
        },
        Some( size ) => size as size_t
    };

    realloc_impl( old_ptr, size )
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn free( ptr: *mut c_void ) {
    let _guard = match HookGuard::enter() {
        Some( guard ) => guard,
        None => return resolver::free( ptr )
    };

    resolver::free( ptr );
    track_release( ptr );
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn posix_memalign( memptr: *mut *mut c_void, alignment: size_t, size: size_t ) -> c_int {
    let _guard = match HookGuard::enter() {
        Some( guard ) => guard,
        None => return resolver::posix_memalign( memptr, alignment, size )
    };

    let result = resolver::posix_memalign( memptr, alignment, size );
    if result == 0 && !memptr.is_null() {
        track_allocation( *memptr, size as usize );
    }

    result
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn aligned_alloc( alignment: size_t, size: size_t ) -> *mut c_void {
    let _guard = match HookGuard::enter() {
        Some( guard ) => guard,
        None => return resolver::aligned_alloc( alignment, size )
    };

    let ptr = resolver::aligned_alloc( alignment, size );
    track_allocation( ptr, size as usize );
    ptr
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn mmap( addr: *mut c_void, length: size_t, prot: c_int, flags: c_int, fildes: c_int, offset: off_t ) -> *mut c_void {
    let _guard = match HookGuard::enter() {
        Some( guard ) => guard,
        None => return resolver::mmap( addr, length, prot, flags, fildes, offset )
    };

    let ptr = resolver::mmap( addr, length, prot, flags, fildes, offset );
    if ptr != libc::MAP_FAILED {
        track_allocation( ptr, length as usize );
    }

    ptr
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn munmap( addr: *mut c_void, length: size_t ) -> c_int {
    let _guard = match HookGuard::enter() {
        Some( guard ) => guard,
        None => return resolver::munmap( addr, length )
    };

    let result = resolver::munmap( addr, length );
    if result == 0 {
        track_release( addr );
    }

    result
}

// operator new( size_t )
#[allow(non_snake_case)]
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn _Znwm( size: size_t ) -> *mut c_void {
    let _guard = match HookGuard::enter() {
        Some( guard ) => guard,
        None => return resolver::cxx_new( size )
    };

    let ptr = resolver::cxx_new( size );
    track_allocation( ptr, size as usize );
    ptr
}

// operator new[]( size_t )
#[allow(non_snake_case)]
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn _Znam( size: size_t ) -> *mut c_void {
    let _guard = match HookGuard::enter() {
        Some( guard ) => guard,
        None => return resolver::cxx_new_array( size )
    };

    let ptr = resolver::cxx_new_array( size );
    track_allocation( ptr, size as usize );
    ptr
}

// operator delete( void* )
#[allow(non_snake_case)]
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn _ZdlPv( ptr: *mut c_void ) {
    let _guard = match HookGuard::enter() {
        Some( guard ) => guard,
        None => return resolver::cxx_delete( ptr )
    };

    resolver::cxx_delete( ptr );
    track_release( ptr );
}

// operator delete[]( void* )
#[allow(non_snake_case)]
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn _ZdaPv( ptr: *mut c_void ) {
    let _guard = match HookGuard::enter() {
        Some( guard ) => guard,
        None => return resolver::cxx_delete_array( ptr )
    };

    resolver::cxx_delete_array( ptr );
    track_release( ptr );
}

// operator delete( void*, size_t )
#[allow(non_snake_case)]
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn _ZdlPvm( ptr: *mut c_void, size: size_t ) {
    let _guard = match HookGuard::enter() {
        Some( guard ) => guard,
        None => return resolver::cxx_delete_sized( ptr, size )
    };

    resolver::cxx_delete_sized( ptr, size );
    track_release( ptr );
}

// operator delete[]( void*, size_t )
#[allow(non_snake_case)]
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn _ZdaPvm( ptr: *mut c_void, size: size_t ) {
    let _guard = match HookGuard::enter() {
        Some( guard ) => guard,
        None => return resolver::cxx_delete_array_sized( ptr, size )
    };

    resolver::cxx_delete_array_sized( ptr, size );
    track_release( ptr );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker;

    // Drives the real hook path end to end: the guard engages, the real
    // allocator runs underneath, and the store picks up the transitions.
    #[test]
    fn test_hooked_roundtrip_is_tracked() {
        const SIZE: usize = 123457;

        let ptr = unsafe { malloc( SIZE ) };
        assert!( !ptr.is_null() );

        let recorded = tracker::snapshot()
            .into_iter()
            .find( |(_, stats)| stats.total_size == SIZE as u64 );
        assert!( recorded.is_some() );

        unsafe { free( ptr ) };

        let still_recorded = tracker::snapshot()
            .into_iter()
            .any( |(_, stats)| stats.total_size == SIZE as u64 );
        assert!( !still_recorded );
    }

    #[test]
    fn test_realloc_rebinds_the_address() {
        const OLD_SIZE: usize = 86531;
        const NEW_SIZE: usize = 97643;

        let ptr = unsafe { malloc( OLD_SIZE ) };
        assert!( !ptr.is_null() );

        let ptr = unsafe { realloc( ptr, NEW_SIZE ) };
        assert!( !ptr.is_null() );

        let snapshot = tracker::snapshot();
        assert!( !snapshot.iter().any( |(_, stats)| stats.total_size == OLD_SIZE as u64 ) );
        assert!( snapshot.iter().any( |(_, stats)| stats.total_size == NEW_SIZE as u64 ) );

        unsafe { free( ptr ) };
    }
}
