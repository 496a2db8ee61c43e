use std::ffi::CStr;
use std::mem;

use libc::{c_void, Dl_info};

pub const SYMBOL_MAXLEN: usize = 128;

pub struct ResolvedFrame {
    pub address: usize,
    pub symbol: Option< String >,
    pub symbol_offset: usize,
    pub module: Option< String >,
    pub module_offset: usize
}

impl ResolvedFrame {
    fn unresolved( address: usize ) -> Self {
        ResolvedFrame {
            address,
            symbol: None,
            symbol_offset: 0,
            module: None,
            module_offset: 0
        }
    }
}

/// Translates a return address into the nearest exported symbol at or below
/// it within its loaded module. Stripped binaries and JIT code resolve to
/// an address-only placeholder rather than an error.
pub fn resolve( address: usize ) -> ResolvedFrame {
    let mut info: Dl_info = unsafe { mem::zeroed() };
    let found = unsafe { libc::dladdr( address as *const c_void, &mut info ) };
    if found == 0 {
        return ResolvedFrame::unresolved( address );
    }

    let module = if info.dli_fname.is_null() {
        None
    } else {
        Some( unsafe { CStr::from_ptr( info.dli_fname ) }.to_string_lossy().into_owned() )
    };
    let module_offset = address.wrapping_sub( info.dli_fbase as usize );

    let (symbol, symbol_offset) = if !info.dli_sname.is_null() && !info.dli_saddr.is_null() {
        let raw = unsafe { CStr::from_ptr( info.dli_sname ) }.to_string_lossy();
        let symbol = truncate_symbol( &demangle( &raw ) );
        (Some( symbol ), address.wrapping_sub( info.dli_saddr as usize ))
    } else {
        (None, 0)
    };

    ResolvedFrame {
        address,
        symbol,
        symbol_offset,
        module,
        module_offset
    }
}

// The Rust demangler runs first; its legacy scheme is a subset of the
// Itanium one, so the C++ demangler would accept Rust symbols too and keep
// their hash suffixes.
pub fn demangle( raw: &str ) -> String {
    if let Ok( demangled ) = rustc_demangle::try_demangle( raw ) {
        return demangled.to_string();
    }

    if let Ok( symbol ) = cpp_demangle::Symbol::new( raw ) {
        if let Ok( demangled ) = symbol.demangle( &cpp_demangle::DemangleOptions::default() ) {
            return demangled;
        }
    }

    raw.to_owned()
}

pub fn truncate_symbol( name: &str ) -> String {
    if name.len() <= SYMBOL_MAXLEN {
        return name.to_owned();
    }

    let mut cut = SYMBOL_MAXLEN - 3;
    while !name.is_char_boundary( cut ) {
        cut -= 1;
    }

    format!( "{}...", &name[ ..cut ] )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demangle_rust_symbol() {
        let demangled = demangle( "_ZN4core3fmt9Formatter9write_str17h1234567890abcdefE" );
        assert!( demangled.contains( "core::fmt::Formatter" ), "{}", demangled );
        assert!( demangled.contains( "write_str" ), "{}", demangled );
    }

    #[test]
    fn test_demangle_cxx_symbol() {
        let demangled = demangle( "_ZNSt6vectorIiSaIiEE9push_backERKi" );
        assert!( demangled.contains( "push_back" ), "{}", demangled );
    }

    #[test]
    fn test_demangle_passes_plain_names_through() {
        assert_eq!( demangle( "malloc" ), "malloc" );
    }

    #[test]
    fn test_truncate_symbol() {
        let short = "x".repeat( SYMBOL_MAXLEN );
        assert_eq!( truncate_symbol( &short ), short );

        let long = "y".repeat( SYMBOL_MAXLEN * 2 );
        let truncated = truncate_symbol( &long );
        assert_eq!( truncated.len(), SYMBOL_MAXLEN );
        assert!( truncated.ends_with( "..." ) );
    }

    #[test]
    fn test_resolve_dynamic_symbol() {
        let frame = resolve( libc::malloc as usize );
        assert!( frame.module.is_some() );
    }

    #[test]
    fn test_resolve_unmapped_address_degrades_to_placeholder() {
        let frame = resolve( 1 );
        assert!( frame.symbol.is_none() );
        assert_eq!( frame.address, 1 );
    }
}
