//! Cross-module tests
//!
//! Unit tests live next to the code they cover; these exercise several
//! managers together through their public surfaces.
