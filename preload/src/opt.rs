use std::env;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SortKey {
    Size,
    Count
}

impl SortKey {
    pub fn name( self ) -> &'static str {
        match self {
            SortKey::Size => "size",
            SortKey::Count => "count"
        }
    }
}

#[derive(Clone, Debug)]
pub struct Opts {
    pub top: usize,
    pub sort_keys: Vec< SortKey >,
    pub flamegraph: bool,
    pub outfile: Option< String >,
    pub ignore_file: Option< String >
}

impl Default for Opts {
    fn default() -> Self {
        Opts {
            top: 10,
            sort_keys: vec![ SortKey::Size ],
            flamegraph: false,
            outfile: None,
            ignore_file: None
        }
    }
}

// Unknown keys sort by size, matching what the report does for any
// unrecognized order.
pub fn parse_sort_keys( raw: &str ) -> Vec< SortKey > {
    let keys: Vec< SortKey > = raw.split( ',' )
        .filter( |key| !key.trim().is_empty() )
        .map( |key| {
            match key.trim() {
                "count" => SortKey::Count,
                "size" => SortKey::Size,
                other => {
                    warn!( "Unknown sort key '{}'; sorting by size", other );
                    SortKey::Size
                }
            }
        })
        .collect();

    if keys.is_empty() {
        vec![ SortKey::Size ]
    } else {
        keys
    }
}

static mut OPTS: Option< Opts > = None;

pub unsafe fn initialize() {
    let top = match env::var( "HEAPSCOPE_NUM_TOP_BACKTRACE" ) {
        Ok( value ) => match value.parse::< usize >() {
            Ok( top ) => top,
            Err( _ ) => {
                warn!( "Invalid HEAPSCOPE_NUM_TOP_BACKTRACE '{}'; defaulting to 10", value );
                10
            }
        },
        Err( _ ) => 10
    };

    info!( "Number of top backtraces to report: {}", top );

    let sort_keys = match env::var( "HEAPSCOPE_SORT_KEYS" ) {
        Ok( value ) => parse_sort_keys( &value ),
        Err( _ ) => vec![ SortKey::Size ]
    };

    for key in &sort_keys {
        info!( "Sort key: {}", key.name() );
    }

    let flamegraph = env::var_os( "HEAPSCOPE_FLAME_GRAPH" )
        .map( |value| value == "1" )
        .unwrap_or( false );

    if flamegraph {
        info!( "Report format: folded stacks" );
    } else {
        info!( "Report format: table" );
    }

    let outfile = env::var( "HEAPSCOPE_OUTFILE" ).ok().filter( |value| !value.is_empty() );
    match outfile {
        Some( ref path ) => info!( "Report destination: {}.<pid>", path ),
        None => info!( "Report destination: stderr" )
    }

    let ignore_file = env::var( "HEAPSCOPE_IGNORE" ).ok().filter( |value| !value.is_empty() );
    if let Some( ref path ) = ignore_file {
        info!( "Ignore patterns file: {}", path );
    }

    OPTS = Some( Opts {
        top,
        sort_keys,
        flamegraph,
        outfile,
        ignore_file
    });
}

pub fn get() -> &'static Opts {
    lazy_static! {
        static ref FALLBACK: Opts = Opts::default();
    }

    unsafe { OPTS.as_ref() }.unwrap_or( &FALLBACK )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sort_keys_in_order() {
        assert_eq!( parse_sort_keys( "count,size" ), vec![ SortKey::Count, SortKey::Size ] );
        assert_eq!( parse_sort_keys( "size" ), vec![ SortKey::Size ] );
    }

    #[test]
    fn test_parse_sort_keys_unknown_falls_back_to_size() {
        assert_eq!( parse_sort_keys( "banana" ), vec![ SortKey::Size ] );
        assert_eq!( parse_sort_keys( "" ), vec![ SortKey::Size ] );
    }
}
