//! Command-line surface: argument definitions, display infrastructure, and
//! one module per subcommand.

pub mod args;
pub mod constants;
pub mod count;
pub mod dump;
pub mod merge;
pub mod stats;
