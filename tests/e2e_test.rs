//! Integration tests.  The engine runs in-process against a temp directory
//! with a fake compiler; the command line runs as the dynbuild binary.

mod e2e;
