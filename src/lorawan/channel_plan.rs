//! Application-supplied channel plans

use heapless::Vec;

use super::phy::RegionalPhy;
use super::region::{Channel, DrRange, MAX_CHANNELS};
use crate::error::{Error, Result};

/// One entry of a channel plan
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelParams {
    /// Channel index
    pub id: u8,
    /// Uplink frequency in Hz
    pub frequency: u32,
    /// RX1 frequency in Hz, 0 to use the uplink frequency
    pub rx1_frequency: u32,
    /// Allowed datarates
    pub dr_range: DrRange,
}

impl From<(u8, Channel)> for ChannelParams {
    fn from((id, channel): (u8, Channel)) -> Self {
        Self {
            id,
            frequency: channel.frequency,
            rx1_frequency: channel.rx1_frequency,
            dr_range: channel.dr_range,
        }
    }
}

/// List of channels
pub type Plan = Vec<ChannelParams, MAX_CHANNELS>;

/// Channel plan operations on a [`RegionalPhy`]
pub struct ChannelPlan<'a> {
    phy: &'a mut RegionalPhy,
}

impl<'a> ChannelPlan<'a> {
    /// Operate on `phy`
    pub fn new(phy: &'a mut RegionalPhy) -> Self {
        Self { phy }
    }

    fn check_supported(&self) -> Result<()> {
        if self.phy.tables().custom_channel_plan_supported {
            Ok(())
        } else {
            Err(Error::ServiceUnknown)
        }
    }

    /// Install every channel of `plan`, stopping at the first rejection
    pub fn set_plan(&mut self, plan: &[ChannelParams]) -> Result<()> {
        self.check_supported()?;
        if plan.len() > self.phy.max_channels() {
            return Err(Error::ParameterInvalid);
        }
        for entry in plan {
            let channel = Channel {
                frequency: entry.frequency,
                rx1_frequency: entry.rx1_frequency,
                dr_range: entry.dr_range,
                band: 0,
            };
            self.phy.add_channel(&channel, entry.id)?;
        }
        info!("channel plan of {} channels installed", plan.len());
        Ok(())
    }

    /// Enabled channels
    pub fn get_plan(&self) -> Result<Plan> {
        self.check_supported()?;
        let mut plan = Plan::new();
        for id in self.phy.channel_mask().iter() {
            if let Some(channel) = self.phy.channel(id) {
                plan.push(ChannelParams::from((id as u8, channel)))
                    .map_err(|_| Error::LengthError)?;
            }
        }
        Ok(plan)
    }

    /// Remove every enabled channel except the default ones
    pub fn remove_plan(&mut self) -> Result<()> {
        self.check_supported()?;
        let first = self.phy.default_channel_count();
        for id in self.phy.channel_mask().iter().filter(|id| *id >= first) {
            self.phy.remove_channel(id as u8);
        }
        Ok(())
    }

    /// Remove channel `id`; default channels cannot be removed
    pub fn remove_single_channel(&mut self, id: u8) -> Result<()> {
        self.check_supported()?;
        if usize::from(id) >= self.phy.max_channels() || !self.phy.remove_channel(id) {
            return Err(Error::ParameterInvalid);
        }
        Ok(())
    }
}
