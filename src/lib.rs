//! Device pairing protocol.
//!
//! A new device with no credentials opens a pairing session anonymously and waits
//! on a server-streamed sequence of frames. An already trusted attestation device
//! looks the session up through an out-of-band exchange payload and approves or
//! rejects it; the approval carries a certificate for the new device's key. Frames
//! are CBOR or text behind a one-byte tag, authenticated calls are Ed25519 signed.

pub mod config;
pub mod crypto;
pub mod e2e_common;
pub mod error;
pub mod frame;
pub mod messages;
pub mod sdk;
pub mod session;
pub mod transport;

pub use config::{ClientConfig, ConfigError, ServiceConfig, TlsConfig};
pub use crypto::identity::{Credentials, DeviceCertificate, NodeAuthority};
pub use crypto::{RequestOp, SignedRequest};
pub use error::PairingError;
pub use frame::{Frame, FrameError};
pub use messages::{
    GetPairingDataResponse, PairDeviceRequest, PairDeviceResponse, PairingOpened, PairingOutcome,
    ProtocolVersion,
};
pub use sdk::{AttestationDeviceClient, NewDeviceClient, PairingEvent, PairingStream};
pub use session::state::PairingState;
pub use session::PairingService;
pub use transport::{LocalTransport, PairingTransport, TcpTransport, TimeoutTransport};
