use std::mem::transmute;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{
    c_char,
    c_int,
    c_void,
    off_t,
    size_t
};

use crate::syscall;

// `dlsym` itself allocates, so while resolution is in flight (and forever,
// if a symbol is missing) calls are served by the glibc-private entry
// points underneath the public ones.
extern "C" {
    #[link_name = "__libc_malloc"]
    fn malloc_fallback( size: size_t ) -> *mut c_void;
    #[link_name = "__libc_calloc"]
    fn calloc_fallback( count: size_t, element_size: size_t ) -> *mut c_void;
    #[link_name = "__libc_realloc"]
    fn realloc_fallback( ptr: *mut c_void, size: size_t ) -> *mut c_void;
    #[link_name = "__libc_free"]
    fn free_fallback( ptr: *mut c_void );
    #[link_name = "__libc_memalign"]
    fn memalign_fallback( alignment: size_t, size: size_t ) -> *mut c_void;
}

type MallocFn = unsafe extern "C" fn( size_t ) -> *mut c_void;
type CallocFn = unsafe extern "C" fn( size_t, size_t ) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn( *mut c_void, size_t ) -> *mut c_void;
type FreeFn = unsafe extern "C" fn( *mut c_void );
type PosixMemalignFn = unsafe extern "C" fn( *mut *mut c_void, size_t, size_t ) -> c_int;
type AlignedAllocFn = unsafe extern "C" fn( size_t, size_t ) -> *mut c_void;
type MmapFn = unsafe extern "C" fn( *mut c_void, size_t, c_int, c_int, c_int, off_t ) -> *mut c_void;
type MunmapFn = unsafe extern "C" fn( *mut c_void, size_t ) -> c_int;
type DeleteSizedFn = unsafe extern "C" fn( *mut c_void, size_t );

static REAL_MALLOC: AtomicUsize = AtomicUsize::new( 0 );
static REAL_CALLOC: AtomicUsize = AtomicUsize::new( 0 );
static REAL_REALLOC: AtomicUsize = AtomicUsize::new( 0 );
static REAL_FREE: AtomicUsize = AtomicUsize::new( 0 );
static REAL_POSIX_MEMALIGN: AtomicUsize = AtomicUsize::new( 0 );
static REAL_ALIGNED_ALLOC: AtomicUsize = AtomicUsize::new( 0 );
static REAL_MMAP: AtomicUsize = AtomicUsize::new( 0 );
static REAL_MUNMAP: AtomicUsize = AtomicUsize::new( 0 );
static REAL_CXX_NEW: AtomicUsize = AtomicUsize::new( 0 );
static REAL_CXX_NEW_ARRAY: AtomicUsize = AtomicUsize::new( 0 );
static REAL_CXX_DELETE: AtomicUsize = AtomicUsize::new( 0 );
static REAL_CXX_DELETE_ARRAY: AtomicUsize = AtomicUsize::new( 0 );
static REAL_CXX_DELETE_SIZED: AtomicUsize = AtomicUsize::new( 0 );
static REAL_CXX_DELETE_ARRAY_SIZED: AtomicUsize = AtomicUsize::new( 0 );

unsafe fn resolve( slot: &AtomicUsize, name: &[u8] ) {
    let address = libc::dlsym( libc::RTLD_NEXT, name.as_ptr() as *const c_char );
    if address.is_null() {
        warn!(
            "Unable to resolve '{}'; calls will permanently pass through untracked",
            std::str::from_utf8( &name[ ..name.len() - 1 ] ).unwrap_or( "?" )
        );
        return;
    }

    slot.store( address as usize, Ordering::Release );
}

/// Binds every forwarded routine to the next definition in the dynamic
/// symbol search order. Any allocation `dlsym` makes while this runs
/// re-enters the hooks, finds the slots still empty and lands on the
/// fallbacks, so resolution never waits on itself.
pub unsafe fn initialize() {
    resolve( &REAL_MALLOC, b"malloc\0" );
    resolve( &REAL_CALLOC, b"calloc\0" );
    resolve( &REAL_REALLOC, b"realloc\0" );
    resolve( &REAL_FREE, b"free\0" );
    resolve( &REAL_POSIX_MEMALIGN, b"posix_memalign\0" );
    resolve( &REAL_ALIGNED_ALLOC, b"aligned_alloc\0" );
    resolve( &REAL_MMAP, b"mmap\0" );
    resolve( &REAL_MUNMAP, b"munmap\0" );
    resolve( &REAL_CXX_NEW, b"_Znwm\0" );
    resolve( &REAL_CXX_NEW_ARRAY, b"_Znam\0" );
    resolve( &REAL_CXX_DELETE, b"_ZdlPv\0" );
    resolve( &REAL_CXX_DELETE_ARRAY, b"_ZdaPv\0" );
    resolve( &REAL_CXX_DELETE_SIZED, b"_ZdlPvm\0" );
    resolve( &REAL_CXX_DELETE_ARRAY_SIZED, b"_ZdaPvm\0" );
}

pub unsafe fn malloc( size: size_t ) -> *mut c_void {
    let real = REAL_MALLOC.load( Ordering::Acquire );
    if real != 0 {
        transmute::< usize, MallocFn >( real )( size )
    } else {
        malloc_fallback( size )
    }
}

pub unsafe fn calloc( count: size_t, element_size: size_t ) -> *mut c_void {
    let real = REAL_CALLOC.load( Ordering::Acquire );
    if real != 0 {
        transmute::< usize, CallocFn >( real )( count, element_size )
    } else {
        calloc_fallback( count, element_size )
    }
}

pub unsafe fn realloc( ptr: *mut c_void, size: size_t ) -> *mut c_void {
    let real = REAL_REALLOC.load( Ordering::Acquire );
    if real != 0 {
        transmute::< usize, ReallocFn >( real )( ptr, size )
    } else {
        realloc_fallback( ptr, size )
    }
}

pub unsafe fn free( ptr: *mut c_void ) {
    let real = REAL_FREE.load( Ordering::Acquire );
    if real != 0 {
        transmute::< usize, FreeFn >( real )( ptr )
    } else {
        free_fallback( ptr )
    }
}

pub unsafe fn posix_memalign( memptr: *mut *mut c_void, alignment: size_t, size: size_t ) -> c_int {
    let real = REAL_POSIX_MEMALIGN.load( Ordering::Acquire );
    if real != 0 {
        return transmute::< usize, PosixMemalignFn >( real )( memptr, alignment, size );
    }

    let ptr = memalign_fallback( alignment, size );
    if ptr.is_null() {
        libc::ENOMEM
    } else {
        *memptr = ptr;
        0
    }
}

pub unsafe fn aligned_alloc( alignment: size_t, size: size_t ) -> *mut c_void {
    let real = REAL_ALIGNED_ALLOC.load( Ordering::Acquire );
    if real != 0 {
        transmute::< usize, AlignedAllocFn >( real )( alignment, size )
    } else {
        memalign_fallback( alignment, size )
    }
}

pub unsafe fn mmap( addr: *mut c_void, length: size_t, prot: c_int, flags: c_int, fildes: c_int, offset: off_t ) -> *mut c_void {
    let real = REAL_MMAP.load( Ordering::Acquire );
    if real != 0 {
        transmute::< usize, MmapFn >( real )( addr, length, prot, flags, fildes, offset )
    } else {
        syscall::mmap( addr, length, prot, flags, fildes, offset )
    }
}

pub unsafe fn munmap( addr: *mut c_void, length: size_t ) -> c_int {
    let real = REAL_MUNMAP.load( Ordering::Acquire );
    if real != 0 {
        transmute::< usize, MunmapFn >( real )( addr, length )
    } else {
        syscall::munmap( addr, length )
    }
}

// glibc's default C++ operators bottom out in malloc/free, which makes
// those the right fallbacks during early resolution.
pub unsafe fn cxx_new( size: size_t ) -> *mut c_void {
    let real = REAL_CXX_NEW.load( Ordering::Acquire );
    if real != 0 {
        transmute::< usize, MallocFn >( real )( size )
    } else {
        malloc_fallback( size )
    }
}

pub unsafe fn cxx_new_array( size: size_t ) -> *mut c_void {
    let real = REAL_CXX_NEW_ARRAY.load( Ordering::Acquire );
    if real != 0 {
        transmute::< usize, MallocFn >( real )( size )
    } else {
        malloc_fallback( size )
    }
}

pub unsafe fn cxx_delete( ptr: *mut c_void ) {
    let real = REAL_CXX_DELETE.load( Ordering::Acquire );
    if real != 0 {
        transmute::< usize, FreeFn >( real )( ptr )
    } else {
        free_fallback( ptr )
    }
}

pub unsafe fn cxx_delete_array( ptr: *mut c_void ) {
    let real = REAL_CXX_DELETE_ARRAY.load( Ordering::Acquire );
    if real != 0 {
        transmute::< usize, FreeFn >( real )( ptr )
    } else {
        free_fallback( ptr )
    }
}

pub unsafe fn cxx_delete_sized( ptr: *mut c_void, size: size_t ) {
    let real = REAL_CXX_DELETE_SIZED.load( Ordering::Acquire );
    if real != 0 {
        transmute::< usize, DeleteSizedFn >( real )( ptr, size )
    } else {
        free_fallback( ptr )
    }
}

pub unsafe fn cxx_delete_array_sized( ptr: *mut c_void, size: size_t ) {
    let real = REAL_CXX_DELETE_ARRAY_SIZED.load( Ordering::Acquire );
    if real != 0 {
        transmute::< usize, DeleteSizedFn >( real )( ptr, size )
    } else {
        free_fallback( ptr )
    }
}
