/// Radio driver interface
pub mod traits;

pub use traits::{
    ModulationParams, Modem, Radio, RadioEvent, RadioState, RxConfig, TxConfig, MAX_PHY_PAYLOAD,
};
