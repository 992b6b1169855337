//! Clients for both ends of a pairing.
//!
//! [`NewDeviceClient`] runs on the device asking to join and holds no credentials;
//! [`AttestationDeviceClient`] runs on a device that is already trusted and decides.
pub mod attestation;
pub mod new_device;

pub use attestation::AttestationDeviceClient;
pub use new_device::{NewDeviceClient, PairingEvent, PairingStream};
