pub mod fixtures;
pub mod stub_sandbox;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use stub_sandbox::*;
