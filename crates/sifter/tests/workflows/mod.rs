use super::*;

mod acquisition;
mod checkpoint;
mod resume;
mod threshold;
