//! The standard two-leaf script for ordinary vtxos.
//!
//! Spending paths:
//! - forfeit: user + server cosign (the collaborative path used in rounds)
//! - exit: user alone, after a relative delay (the unilateral escape hatch)

use bitcoin::key::XOnlyPublicKey;
use bitcoin::ScriptBuf;
use thiserror::Error;

use crate::script::{VtxoScript, VtxoScriptError};
use crate::tapscript::{
    CsvMultisigParams, MultisigMode, MultisigParams, RelativeTimelock, TapscriptError,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefaultVtxoError {
    #[error(transparent)]
    Tapscript(#[from] TapscriptError),

    #[error(transparent)]
    Script(#[from] VtxoScriptError),
}

/// The forfeit + exit script pair committed into a plain vtxo output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultVtxoScript {
    pub user: XOnlyPublicKey,
    pub server: XOnlyPublicKey,
    pub exit_delay: RelativeTimelock,
    forfeit: ScriptBuf,
    exit: ScriptBuf,
    script: VtxoScript,
}

impl DefaultVtxoScript {
    pub fn new(
        user: XOnlyPublicKey,
        server: XOnlyPublicKey,
        exit_delay: RelativeTimelock,
    ) -> Result<DefaultVtxoScript, DefaultVtxoError> {
        let forfeit =
            MultisigParams::new(vec![user, server], MultisigMode::CheckSig).to_script()?;
        let exit = CsvMultisigParams::new(exit_delay, vec![user]).to_script()?;
        let script = VtxoScript::new(vec![forfeit.clone(), exit.clone()])?;
        Ok(DefaultVtxoScript { user, server, exit_delay, forfeit, exit, script })
    }

    pub fn forfeit_script(&self) -> &ScriptBuf {
        &self.forfeit
    }

    pub fn exit_script(&self) -> &ScriptBuf {
        &self.exit
    }

    pub fn script(&self) -> &VtxoScript {
        &self.script
    }

    pub fn pk_script(&self) -> ScriptBuf {
        self.script.pk_script()
    }
}
