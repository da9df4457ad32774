//! Custom Resource Definitions for the sample controller

mod foo;

pub use foo::{Foo, FooSpec, FooStatus};
