/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Control-plane event stream types. Only the five event kinds this bridge
//! reacts to are modeled explicitly; everything else falls into `Other`.

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub channelvars: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StasisEvent {
    StasisStart {
        channel: ChannelRef,
        #[serde(default)]
        args: Vec<String>,
    },
    StasisEnd {
        channel: ChannelRef,
    },
    ChannelDestroyed {
        channel: ChannelRef,
    },
    ChannelHangupRequest {
        channel: ChannelRef,
    },
    ChannelDtmfReceived {
        channel: ChannelRef,
        digit: String,
    },
    ChannelTalkingStarted {
        channel: ChannelRef,
    },
    ChannelTalkingFinished {
        channel: ChannelRef,
    },
    #[serde(other)]
    Other,
}

/// Classification of a channel name at StasisStart, per the triage rules in
/// the control client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Snoop,
    Trunk,
    InternalTransport,
    Unknown,
}

pub fn classify_channel(name: &str, trunk_prefix: &str) -> ChannelKind {
    if name.starts_with("Snoop/") {
        ChannelKind::Snoop
    } else if name.starts_with(trunk_prefix) {
        ChannelKind::Trunk
    } else if name.starts_with("UnicastRTP/") {
        ChannelKind::InternalTransport
    } else {
        ChannelKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snoop_channels_are_classified_regardless_of_trunk_prefix() {
        assert_eq!(
            classify_channel("Snoop/PJSIP/trunk-00000001", "PJSIP/trunk-"),
            ChannelKind::Snoop
        );
    }

    #[test]
    fn trunk_prefix_match_is_classified_as_trunk() {
        assert_eq!(
            classify_channel("PJSIP/trunk-00000002", "PJSIP/trunk-"),
            ChannelKind::Trunk
        );
    }

    #[test]
    fn unicast_rtp_is_internal_transport() {
        assert_eq!(
            classify_channel("UnicastRTP/10.0.0.5:4000-0x1", "PJSIP/trunk-"),
            ChannelKind::InternalTransport
        );
    }

    #[test]
    fn local_channels_are_unknown_and_get_hung_up() {
        assert_eq!(
            classify_channel("Local/s@default-0000001;1", "PJSIP/trunk-"),
            ChannelKind::Unknown
        );
    }
}
