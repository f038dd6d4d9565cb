/// Whether the receiver may change the payee output of the original PSBT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OutputSubstitution {
    Enabled,
    Disabled,
}

impl OutputSubstitution {
    /// Substitution is only allowed when neither side disabled it.
    pub(crate) fn combine(self, other: Self) -> Self {
        if self == Self::Enabled && other == Self::Enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}
