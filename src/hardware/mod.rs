//! Hardware layer: GPIO register protocol, the beam mapper that drives it,
//! and a simulated front end for running without a radio.

pub mod gpio;
pub mod mapper;
pub mod mock;

pub use gpio::{BitRange, GpioAttr, GpioLayout, RegisterWrite, GPIO_BANK};
pub use mapper::BeamMapper;
pub use mock::{MockFrontEnd, MockFrontEndConfig, RegisterImage};
