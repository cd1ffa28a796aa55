pub mod binio;
pub mod dag;
pub mod densemap;
pub mod digestcache;
pub mod driver;
pub mod exec;
pub mod hash;
pub mod includescan;
pub mod printing;
pub mod queue;
pub mod run;
pub mod scancache;
pub mod signal;
pub mod signer;
pub mod statcache;
pub mod statefile;
pub mod terminal;
pub mod throttle;
pub mod validate;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
