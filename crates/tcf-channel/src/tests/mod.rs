//! Channel-level tests driving a real channel against a scripted remote.

mod support;
