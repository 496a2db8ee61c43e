#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

mod api;
mod global;
mod init;
mod logger;
mod opt;
mod output;
mod report;
mod resolver;
mod spin_lock;
mod symbols;
mod syscall;
mod timestamp;
mod tls;
mod tracker;
mod unwind;
mod utils;

lazy_static! {
    pub(crate) static ref PID: u32 = {
        let pid = unsafe { libc::getpid() } as u32;
        pid
    };
}
