#[macro_use]
extern crate log;

use std::env;
use std::error::Error;
use std::ffi::{OsStr, OsString};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process;
use std::process::Command;

use structopt::StructOpt;

const PRELOAD_LIBRARY: &str = "libheapscope.so";

#[derive(StructOpt, Debug)]
#[structopt(
    name = "heapscope",
    about = "Collects and reports heap allocated memory",
    setting = structopt::clap::AppSettings::TrailingVarArg
)]
struct Opt {
    /// Number of top backtraces to show
    #[structopt(long = "top", default_value = "10")]
    top: u32,

    /// Sort backtraces based on KEYS (`size` or `count`, comma separated)
    #[structopt(short = "s", long = "sort", default_value = "size")]
    sort: String,

    /// Print the heap trace in flamegraph-compatible format
    #[structopt(long = "flame-graph")]
    flamegraph: bool,

    /// Save the report to FILE.<pid> instead of stderr
    #[structopt(short = "o", long = "outfile", parse(from_os_str))]
    outfile: Option< PathBuf >,

    /// File with substring patterns to exclude from the report
    #[structopt(long = "ignore", parse(from_os_str))]
    ignore: Option< PathBuf >,

    /// The program to run, with its arguments
    #[structopt(parse(from_os_str), required = true)]
    command: Vec< OsString >
}

// The tracee must see our library first in its symbol search order, ahead
// of whatever was already being preloaded.
fn preload_value( library: &Path, old_preload: Option< &OsStr > ) -> OsString {
    let mut value = OsString::from( library );
    if let Some( old_preload ) = old_preload {
        if !old_preload.is_empty() {
            value.push( ":" );
            value.push( old_preload );
        }
    }

    value
}

fn child_environment( opt: &Opt, library: &Path, old_preload: Option< &OsStr > ) -> Vec< (OsString, OsString) > {
    let mut environment = vec![
        ("LD_PRELOAD".into(), preload_value( library, old_preload )),
        ("HEAPSCOPE_NUM_TOP_BACKTRACE".into(), opt.top.to_string().into()),
        ("HEAPSCOPE_SORT_KEYS".into(), opt.sort.clone().into()),
        ("HEAPSCOPE_FLAME_GRAPH".into(), if opt.flamegraph { "1".into() } else { "0".into() })
    ];

    if let Some( ref outfile ) = opt.outfile {
        environment.push( ("HEAPSCOPE_OUTFILE".into(), outfile.clone().into()) );
    }

    if let Some( ref ignore ) = opt.ignore {
        environment.push( ("HEAPSCOPE_IGNORE".into(), ignore.clone().into()) );
    }

    environment
}

fn locate_preload_library() -> Result< PathBuf, Box< dyn Error > > {
    if let Some( path ) = env::var_os( "HEAPSCOPE_PRELOAD" ) {
        return Ok( path.into() );
    }

    let mut candidates = Vec::new();
    if let Ok( exe ) = env::current_exe() {
        if let Some( directory ) = exe.parent() {
            candidates.push( directory.join( PRELOAD_LIBRARY ) );
        }
    }
    candidates.push( PathBuf::from( PRELOAD_LIBRARY ) );

    for candidate in candidates {
        if candidate.exists() {
            return Ok( candidate );
        }
    }

    Err( format!(
        "cannot find {}; build it first or point HEAPSCOPE_PRELOAD at it",
        PRELOAD_LIBRARY
    ).into() )
}

fn run( opt: Opt ) -> Result< (), Box< dyn Error > > {
    let library = locate_preload_library()?;
    let library = library.canonicalize().unwrap_or( library );
    info!( "Preloading {}", library.display() );

    let old_preload = env::var_os( "LD_PRELOAD" );
    let environment = child_environment( &opt, &library, old_preload.as_deref() );

    let mut command = Command::new( &opt.command[ 0 ] );
    command.args( &opt.command[ 1.. ] );
    for (key, value) in environment {
        command.env( key, value );
    }

    // On success this never returns.
    let error = command.exec();
    Err( format!( "failed to execute {:?}: {}", opt.command[ 0 ], error ).into() )
}

fn main() {
    if env::var( "RUST_LOG" ).is_err() {
        env::set_var( "RUST_LOG", "info" );
    }

    env_logger::init();

    let opt = Opt::from_args();
    let result = run( opt );
    if let Err( error ) = result {
        error!( "{}", error );
        if !log_enabled!( log::Level::Error ) {
            println!( "ERROR: {}", error );
        }

        process::exit( 1 );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> Opt {
        Opt {
            top: 25,
            sort: "count,size".into(),
            flamegraph: true,
            outfile: Some( "/tmp/report".into() ),
            ignore: None,
            command: vec![ "/bin/true".into() ]
        }
    }

    #[test]
    fn test_child_environment_is_complete() {
        let opt = options();
        let environment = child_environment( &opt, Path::new( "/opt/libheapscope.so" ), None );

        let get = |key: &str| {
            environment.iter()
                .find( |(name, _)| name == key )
                .map( |(_, value)| value.clone() )
        };

        assert_eq!( get( "LD_PRELOAD" ), Some( "/opt/libheapscope.so".into() ) );
        assert_eq!( get( "HEAPSCOPE_NUM_TOP_BACKTRACE" ), Some( "25".into() ) );
        assert_eq!( get( "HEAPSCOPE_SORT_KEYS" ), Some( "count,size".into() ) );
        assert_eq!( get( "HEAPSCOPE_FLAME_GRAPH" ), Some( "1".into() ) );
        assert_eq!( get( "HEAPSCOPE_OUTFILE" ), Some( "/tmp/report".into() ) );
        assert_eq!( get( "HEAPSCOPE_IGNORE" ), None );
    }

    #[test]
    fn test_preload_value_chains_existing_preloads() {
        let value = preload_value( Path::new( "/opt/libheapscope.so" ), Some( OsStr::new( "libother.so" ) ) );
        assert_eq!( value, OsString::from( "/opt/libheapscope.so:libother.so" ) );

        let value = preload_value( Path::new( "/opt/libheapscope.so" ), Some( OsStr::new( "" ) ) );
        assert_eq!( value, OsString::from( "/opt/libheapscope.so" ) );
    }
}
