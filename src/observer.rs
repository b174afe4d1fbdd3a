//! Observer contract for the session coordinator
//! The interface an owning application implements to hear about
//! disconnects and incoming characteristic data.

use crate::types::{CharacteristicInfo, Peripheral};

/// Callbacks the coordinator delivers to its owner.
///
/// Both methods are invoked from one dedicated dispatch task, so an
/// observer always sees them serially and never concurrently with itself,
/// regardless of which internal task produced the underlying event.
pub trait CentralObserver: Send + Sync {
    /// The link to a peripheral dropped. Fired for every disconnect; no
    /// distinction is made between requested and spontaneous ones.
    fn on_disconnect(&self, peripheral: &Peripheral);

    /// A characteristic value arrived, either from an explicit read or an
    /// unsolicited notification push. `data` may be empty or absent.
    fn on_data_received(
        &self,
        data: Option<&[u8]>,
        peripheral: &Peripheral,
        characteristic: &CharacteristicInfo,
    );
}
