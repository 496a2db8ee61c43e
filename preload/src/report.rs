use std::io::{self, Write};

use crate::opt::{self, SortKey};
use crate::output;
use crate::spin_lock::SpinLock;
use crate::symbols;
use crate::syscall;
use crate::timestamp::{get_timestamp, Timestamp};
use crate::tls::ScopedGuard;
use crate::tracker;
use crate::unwind::CallSite;
use crate::utils::{format_bytes, format_duration, read_comm, read_file, read_statm};

type ReportEntry = (CallSite, crate::tracker::SiteStats);

const BORDER: &str = "=================================================================";

fn sort_entries( entries: &mut [ReportEntry], key: SortKey ) {
    entries.sort_by( |(_, lhs), (_, rhs)| {
        let ordering = match key {
            SortKey::Count => {
                rhs.count.cmp( &lhs.count )
                    .then( rhs.total_size.cmp( &lhs.total_size ) )
            },
            SortKey::Size => {
                rhs.total_size.cmp( &lhs.total_size )
                    .then( rhs.count.cmp( &lhs.count ) )
            }
        };

        ordering.then( lhs.serial.cmp( &rhs.serial ) )
    });
}

static IGNORE_PATTERNS: SpinLock< Option< Vec< String > > > = SpinLock::new( None );

fn load_ignore_patterns( path: Option< &str > ) -> Vec< String > {
    let path = match path {
        Some( path ) => path,
        None => return Vec::new()
    };

    match read_file( path ) {
        Ok( raw ) => {
            String::from_utf8_lossy( &raw )
                .lines()
                .filter( |line| !line.is_empty() )
                .map( str::to_owned )
                .collect()
        },
        Err( error ) => {
            warn!( "Failed to open ignore file {}: {}", path, error );
            Vec::new()
        }
    }
}

fn ignore_patterns() -> Vec< String > {
    let mut cached = IGNORE_PATTERNS.lock();
    if let Some( ref patterns ) = *cached {
        return patterns.clone();
    }

    let patterns = load_ignore_patterns( opt::get().ignore_file.as_deref() );
    *cached = Some( patterns.clone() );
    patterns
}

fn is_ignored( report: &str, patterns: &[String] ) -> bool {
    patterns.iter().any( |pattern| report.contains( pattern ) )
}

/// Walks already-sorted entries and keeps the first `top` whose rendered
/// backtrace matches no ignore pattern. A skipped entry doesn't consume the
/// budget, so the report always attempts exactly `top` retained entries.
fn select_top< 'a, F >(
    entries: &'a [ReportEntry],
    top: usize,
    patterns: &[String],
    mut render: F
) -> Vec< (&'a ReportEntry, String) >
    where F: FnMut( &ReportEntry ) -> String
{
    let mut selected = Vec::new();
    for entry in entries {
        if selected.len() == top {
            break;
        }

        let text = render( entry );
        if is_ignored( &text, patterns ) {
            continue;
        }

        selected.push( (entry, text) );
    }

    selected
}

fn render_frame( index: usize, address: usize ) -> String {
    let frame = symbols::resolve( address );
    let mut line = format!( "  {} [{:#014x}] ", index, address );

    if let Some( ref symbol ) = frame.symbol {
        line.push_str( &format!( "{} +{:#x} ", symbol, frame.symbol_offset ) );
    }

    match frame.module {
        Some( ref module ) => line.push_str( &format!( "({} +{:#x})", module, frame.module_offset ) ),
        None => line.push( '?' )
    }

    line
}

// Innermost frame first, one line per frame.
fn render_backtrace( site: &CallSite, depth: usize ) -> String {
    let mut text = String::new();
    for (index, &address) in site[ ..depth ].iter().enumerate() {
        text.push_str( &render_frame( index, address ) );
        text.push( '\n' );
    }

    text
}

fn render_frame_folded( address: usize ) -> String {
    let frame = symbols::resolve( address );
    match (frame.symbol, frame.module) {
        (Some( symbol ), _) => format!( "{}+{:#x}", symbol, frame.symbol_offset ),
        (None, Some( module )) => format!( "{}+{:#x}", module, frame.module_offset ),
        (None, None) => format!( "{:#x}", address )
    }
}

// Outermost frame first, joined by semicolons; the line format flamegraph
// tooling consumes once the weight is appended.
fn folded_frames< F >( site: &CallSite, depth: usize, mut render: F ) -> String
    where F: FnMut( usize ) -> String
{
    let mut line = String::new();
    for &address in site[ ..depth ].iter().rev() {
        if !line.is_empty() {
            line.push( ';' );
        }
        line.push_str( &render( address ) );
    }

    line
}

fn dump_table< W: Write + ?Sized >(
    writer: &mut W,
    entries: &[ReportEntry],
    key: SortKey,
    now: Timestamp,
    top: usize,
    patterns: &[String]
) -> io::Result< () > {
    writeln!(
        writer,
        "[heapscope] dump allocation sorted by '{}' for /proc/{}/maps ({})",
        key.name(),
        syscall::gettid(),
        read_comm()
    )?;

    let selected = select_top( entries, top, patterns, |(site, stats)| {
        render_backtrace( site, stats.depth )
    });

    for (rank, (entry, text)) in selected.iter().enumerate() {
        let stats = &entry.1;
        writeln!(
            writer,
            "=== backtrace #{} === [count/peak: {}/{}] [size/peak: {}/{}] [age: {}]",
            rank + 1,
            stats.count,
            stats.peak_count,
            format_bytes( stats.total_size ),
            format_bytes( stats.peak_total_size ),
            format_duration( now.elapsed_since( stats.birth ) )
        )?;
        write!( writer, "{}", text )?;
        writeln!( writer )?;
    }

    Ok(())
}

fn dump_folded< W: Write + ?Sized >(
    writer: &mut W,
    entries: &[ReportEntry],
    top: usize,
    patterns: &[String]
) -> io::Result< () > {
    let selected = select_top( entries, top, patterns, |(site, stats)| {
        folded_frames( site, stats.depth, render_frame_folded )
    });

    for (entry, line) in selected {
        writeln!( writer, "{} {}", line, entry.1.total_size )?;
    }

    Ok(())
}

// mallinfo is deprecated and 32-bit; this engine assumes the glibc 2.33+
// variant, the same glibc-only assumption the `__libc_*` fallbacks make.
#[allow(dead_code)]
#[repr(C)]
struct Mallinfo2 {
    arena: libc::size_t,
    ordblks: libc::size_t,
    smblks: libc::size_t,
    hblks: libc::size_t,
    hblkhd: libc::size_t,
    usmblks: libc::size_t,
    fsmblks: libc::size_t,
    uordblks: libc::size_t,
    fordblks: libc::size_t,
    keepcost: libc::size_t
}

extern "C" {
    fn mallinfo2() -> Mallinfo2;
}

fn dump_footer< W: Write + ?Sized >( writer: &mut W, entries: &[ReportEntry] ) -> io::Result< () > {
    let total_size: u64 = entries.iter().map( |(_, stats)| stats.total_size ).sum();
    let allocator = unsafe { mallinfo2() };

    writeln!( writer, "[heapscope] heap traced num of backtrace : {}", entries.len() )?;
    writeln!( writer, "[heapscope] heap traced allocation size  : {}", format_bytes( total_size ) )?;
    writeln!( writer, "[heapscope] allocator info (virtual)     : {}",
        format_bytes( allocator.arena as u64 + allocator.hblkhd as u64 ) )?;
    writeln!( writer, "[heapscope] allocator info (resident)    : {}",
        format_bytes( allocator.uordblks as u64 ) )?;

    if let Some( memory ) = read_statm() {
        writeln!( writer, "[heapscope] statm info (VSS/RSS/shared)  : {} / {} / {}",
            format_bytes( memory.vss ),
            format_bytes( memory.rss ),
            format_bytes( memory.shared ) )?;
    }

    Ok(())
}

/// Renders the current aggregates. Snapshots under the store's lock, then
/// sorts, symbolizes and writes with the lock released; the thread's guard
/// stays on for the whole dump so none of this shows up in the statistics.
pub fn dump( sort_keys: &[SortKey], flamegraph: bool ) {
    let _guard = ScopedGuard::enter();

    let snapshot = tracker::snapshot();
    if snapshot.is_empty() {
        return;
    }

    let patterns = ignore_patterns();
    let now = get_timestamp();
    let top = opt::get().top;

    let result = output::with( |writer| -> io::Result< () > {
        let mut entries = snapshot;
        if flamegraph {
            // Only the first sort order applies to folded output.
            let key = sort_keys.first().copied().unwrap_or( SortKey::Size );
            sort_entries( &mut entries, key );
            dump_folded( writer, &entries, top, &patterns )
        } else {
            writeln!( writer, "{}", BORDER )?;
            for &key in sort_keys {
                sort_entries( &mut entries, key );
                dump_table( writer, &entries, key, now, top, &patterns )?;
            }
            dump_footer( writer, &entries )?;
            writeln!( writer, "{}", BORDER )
        }
    });

    if let Err( error ) = result {
        warn!( "Failed to write the report: {}", error );
    }
}

pub fn dump_by( key: SortKey ) {
    dump( &[ key ], opt::get().flamegraph );
}

/// The reset operation: unconditionally empties both maps.
pub fn clear() {
    let _guard = ScopedGuard::enter();
    tracker::clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::Timestamp;
    use crate::tracker::SiteStats;
    use crate::unwind::MAX_STACK_DEPTH;

    fn entry( serial: u64, count: u64, total_size: u64 ) -> ReportEntry {
        let mut frames = [0; MAX_STACK_DEPTH];
        frames[ 0 ] = 0x1000 + serial as usize;
        frames[ 1 ] = 0x2000 + serial as usize;

        (frames, SiteStats {
            count,
            peak_count: count,
            total_size,
            peak_total_size: total_size,
            depth: 2,
            birth: Timestamp::from_nsecs( 0 ),
            serial
        })
    }

    #[test]
    fn test_sort_by_size_breaks_ties_on_count() {
        let mut entries = vec![ entry( 0, 1, 50 ), entry( 1, 9, 50 ), entry( 2, 2, 80 ) ];
        sort_entries( &mut entries, SortKey::Size );

        let sizes: Vec< _ > = entries.iter().map( |(_, stats)| stats.total_size ).collect();
        assert_eq!( sizes, vec![ 80, 50, 50 ] );
        assert_eq!( entries[ 1 ].1.count, 9 );
        assert_eq!( entries[ 2 ].1.count, 1 );
    }

    #[test]
    fn test_sort_by_count_breaks_ties_on_size() {
        let mut entries = vec![ entry( 0, 5, 10 ), entry( 1, 5, 90 ), entry( 2, 7, 1 ) ];
        sort_entries( &mut entries, SortKey::Count );

        let counts: Vec< _ > = entries.iter().map( |(_, stats)| stats.count ).collect();
        assert_eq!( counts, vec![ 7, 5, 5 ] );
        assert_eq!( entries[ 1 ].1.total_size, 90 );
        assert_eq!( entries[ 2 ].1.total_size, 10 );
    }

    #[test]
    fn test_fully_equal_entries_keep_insertion_order() {
        let mut entries = vec![ entry( 2, 5, 10 ), entry( 0, 5, 10 ), entry( 1, 5, 10 ) ];
        sort_entries( &mut entries, SortKey::Size );

        let serials: Vec< _ > = entries.iter().map( |(_, stats)| stats.serial ).collect();
        assert_eq!( serials, vec![ 0, 1, 2 ] );
    }

    #[test]
    fn test_select_top_honors_the_budget() {
        let entries: Vec< _ > = (0..5).map( |serial| entry( serial, 1, 10 ) ).collect();
        let selected = select_top( &entries, 3, &[], |(_, stats)| format!( "site{}", stats.serial ) );
        assert_eq!( selected.len(), 3 );
    }

    #[test]
    fn test_ignored_entries_do_not_consume_the_budget() {
        let entries: Vec< _ > = (0..5).map( |serial| entry( serial, 1, 10 ) ).collect();
        let patterns = vec![ "site1".to_owned() ];

        let selected = select_top( &entries, 3, &patterns, |(_, stats)| format!( "site{}", stats.serial ) );
        let retained: Vec< _ > = selected.iter().map( |(entry, _)| entry.1.serial ).collect();
        assert_eq!( retained, vec![ 0, 2, 3 ] );
    }

    #[test]
    fn test_select_top_runs_out_of_entries_gracefully() {
        let entries: Vec< _ > = (0..2).map( |serial| entry( serial, 1, 10 ) ).collect();
        let patterns = vec![ "site0".to_owned(), "site1".to_owned() ];
        let selected = select_top( &entries, 3, &patterns, |(_, stats)| format!( "site{}", stats.serial ) );
        assert!( selected.is_empty() );
    }

    #[test]
    fn test_folded_frames_are_outermost_first() {
        let mut frames = [0; MAX_STACK_DEPTH];
        frames[ 0 ] = 1;
        frames[ 1 ] = 2;
        frames[ 2 ] = 3;

        let line = folded_frames( &frames, 3, |address| format!( "f{}", address ) );
        assert_eq!( line, "f3;f2;f1" );
    }

    #[test]
    fn test_folded_frames_of_single_frame_have_no_separator() {
        let mut frames = [0; MAX_STACK_DEPTH];
        frames[ 0 ] = 7;

        let line = folded_frames( &frames, 1, |address| format!( "f{}", address ) );
        assert_eq!( line, "f7" );
    }

    #[test]
    fn test_is_ignored_matches_substrings() {
        let patterns = vec![ "std::vec".to_owned() ];
        assert!( is_ignored( "alloc in std::vector<int>::push_back", &patterns ) );
        assert!( !is_ignored( "alloc in my_function", &patterns ) );
        assert!( !is_ignored( "anything", &[] ) );
    }
}
