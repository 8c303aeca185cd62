mod engine_impl;
mod report;
mod runs;

pub use engine_impl::run;
