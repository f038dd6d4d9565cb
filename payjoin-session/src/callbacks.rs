//! The wallet questions a receiver asks while checking an original PSBT.
//!
//! `Ok(true)` and `Ok(false)` are policy answers and may end the session with a rejection.
//! `Err` means the wallet could not answer. It is treated as a refusal: the session is rejected
//! and the sender is told the receiver is unavailable.
//!
//! Every trait is implemented for the matching closure or function:
//!
//! ```
//! use payjoin_session::bitcoin::Script;
//! use payjoin_session::callbacks::IsScriptOwned;
//! use payjoin_session::ImplementationError;
//!
//! let nothing_owned = |_: &Script| -> Result<bool, ImplementationError> { Ok(false) };
//! assert!(!nothing_owned.is_script_owned(Script::new()).unwrap());
//! ```

use bitcoin::{OutPoint, Psbt, Script, Transaction};

use crate::ImplementationError;

/// Would the original transaction be accepted for broadcast, e.g. by `testmempoolaccept`?
pub trait CanBroadcast {
    fn can_broadcast(&self, tx: &Transaction) -> Result<bool, ImplementationError>;
}

impl<F> CanBroadcast for F
where
    F: Fn(&Transaction) -> Result<bool, ImplementationError>,
{
    fn can_broadcast(&self, tx: &Transaction) -> Result<bool, ImplementationError> { self(tx) }
}

/// Does the receiver's wallet control this script?
pub trait IsScriptOwned {
    fn is_script_owned(&self, script: &Script) -> Result<bool, ImplementationError>;
}

impl<F> IsScriptOwned for F
where
    F: Fn(&Script) -> Result<bool, ImplementationError>,
{
    fn is_script_owned(&self, script: &Script) -> Result<bool, ImplementationError> {
        self(script)
    }
}

/// Was this outpoint already offered to the receiver in an earlier session?
pub trait IsOutputKnown {
    fn is_output_known(&self, outpoint: &OutPoint) -> Result<bool, ImplementationError>;
}

impl<F> IsOutputKnown for F
where
    F: Fn(&OutPoint) -> Result<bool, ImplementationError>,
{
    fn is_output_known(&self, outpoint: &OutPoint) -> Result<bool, ImplementationError> {
        self(outpoint)
    }
}

/// Sign and finalize the receiver's inputs of the proposal.
///
/// The returned PSBT must describe the same unsigned transaction.
pub trait ProcessPsbt {
    fn process_psbt(&self, psbt: &Psbt) -> Result<Psbt, ImplementationError>;
}

impl<F> ProcessPsbt for F
where
    F: Fn(&Psbt) -> Result<Psbt, ImplementationError>,
{
    fn process_psbt(&self, psbt: &Psbt) -> Result<Psbt, ImplementationError> { self(psbt) }
}

/// Adapters for wallets that speak serialized formats, such as a node's RPC interface.
pub mod raw {
    use std::str::FromStr;

    use bitcoin::consensus::encode::serialize;
    use bitcoin::{Psbt, Transaction};

    use super::{CanBroadcast, ProcessPsbt};
    use crate::ImplementationError;

    /// Asks about the consensus serialized transaction.
    pub struct CanBroadcastBytes<F>(pub F);

    impl<F> CanBroadcast for CanBroadcastBytes<F>
    where
        F: Fn(&[u8]) -> Result<bool, ImplementationError>,
    {
        fn can_broadcast(&self, tx: &Transaction) -> Result<bool, ImplementationError> {
            (self.0)(&serialize(tx))
        }
    }

    /// Hands over a base64 PSBT and parses the base64 PSBT that comes back.
    pub struct ProcessPsbtBase64<F>(pub F);

    impl<F> ProcessPsbt for ProcessPsbtBase64<F>
    where
        F: Fn(String) -> Result<String, ImplementationError>,
    {
        fn process_psbt(&self, psbt: &Psbt) -> Result<Psbt, ImplementationError> {
            let processed = (self.0)(psbt.to_string())?;
            Ok(Psbt::from_str(&processed)?)
        }
    }
}
