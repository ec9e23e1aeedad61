//! SCSI target emulation core: the controller state machine, device
//! families, block caches, mode pages, and the management RPC surface that
//! together implement the daemon's logic independently of the physical bus.

pub mod bus;
pub mod cache;
pub mod codec;
pub mod controller;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod factory;
pub mod images;
pub mod mode_pages;
pub mod pb;
pub mod properties;
pub mod server;
pub mod simh;

pub use bus::{Bus, LoopbackBus};
pub use controller::Controller;
pub use device::DeviceKind;
pub use dispatcher::Dispatcher;
pub use executor::{Executor, Topology};
pub use factory::{DeviceFactory, ReservationRegistry};
pub use properties::PropertyMap;
pub use server::ManagementServer;
