// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    cfg::enums::FeatureState,
    models::friendship::{POLL_TIMEOUT_MAX, POLL_TIMEOUT_MIN, RECV_DELAY_MS_MIN},
};

/// Smallest allowed network cache level.
const NWK_CACHE_MIN_SIZE: usize = 2;
/// Smallest allowed replay protection list.
const RP_MIN_LIST_SIZE: usize = 1;
/// Highest TTL expressible in the 7-bit field.
const TTL_MAX: u8 = 0x7F;
/// Transmission count fields are 3 bits wide on the wire.
const TRANSMIT_COUNT_MAX: u8 = 7;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Table and pool sizes fixed at boot.
    pub sizes: SizesConfig,
    /// Element array with per-element model layout.
    pub elements: Vec<ElementConfig>,
    /// Node feature defaults.
    pub features: FeaturesConfig,
    /// Network and relay transmission parameters plus default TTL.
    pub transmit: TransmitConfig,
    /// Friendship parameters for both roles.
    pub friendship: FriendshipConfig,
    /// Implementation/runtime parameters outside the mesh protocol.
    pub runtime: RuntimeConfig,
}

/// Static memory layout of every bounded table in the core.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SizesConfig {
    #[serde(rename = "AddrListMaxSize")]
    pub addr_list_max_size: usize,
    #[serde(rename = "VirtualAddrListMaxSize")]
    pub virtual_addr_list_max_size: usize,
    #[serde(rename = "AppKeyListSize")]
    pub app_key_list_size: usize,
    #[serde(rename = "NetKeyListSize")]
    pub net_key_list_size: usize,
    #[serde(rename = "NwkCacheL1Size")]
    pub nwk_cache_l1_size: usize,
    #[serde(rename = "NwkCacheL2Size")]
    pub nwk_cache_l2_size: usize,
    #[serde(rename = "MaxNumFriendships")]
    pub max_num_friendships: usize,
    #[serde(rename = "MaxFriendSubscrListSize")]
    pub max_friend_subscr_list_size: usize,
    #[serde(rename = "MaxNumFriendQueueEntries")]
    pub max_num_friend_queue_entries: usize,
    #[serde(rename = "SarRxTranHistorySize")]
    pub sar_rx_tran_history_size: usize,
    #[serde(rename = "SarRxTranInfoSize")]
    pub sar_rx_tran_info_size: usize,
    #[serde(rename = "SarTxMaxTransactions")]
    pub sar_tx_max_transactions: usize,
    #[serde(rename = "RpListSize")]
    pub rp_list_size: usize,
    #[serde(rename = "NwkOutputFilterSize")]
    pub nwk_output_filter_size: usize,
}

/// One element: location descriptor plus its model identifiers and caps.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ElementConfig {
    #[serde(rename = "Location")]
    pub location: u16,
    #[serde(default, rename = "SigModels")]
    pub sig_models: Vec<u16>,
    #[serde(default, rename = "VendorModels")]
    pub vendor_models: Vec<u32>,
    #[serde(rename = "SubscrListSize")]
    pub subscr_list_size: usize,
    #[serde(rename = "AppKeyBindListSize")]
    pub app_key_bind_list_size: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct FeaturesConfig {
    #[serde(rename = "Relay")]
    pub relay: FeatureState,
    #[serde(rename = "Proxy")]
    pub proxy: FeatureState,
    #[serde(rename = "Friend")]
    pub friend: FeatureState,
    #[serde(rename = "LowPower")]
    pub low_power: FeatureState,
}

/// (count, interval) pair used by both network transmit and relay
/// retransmit states. Count is the number of transmissions minus one;
/// the interval is in 10 ms steps.
#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
pub struct TransmitParams {
    #[serde(rename = "Count")]
    pub count: u8,
    #[serde(rename = "IntervalSteps")]
    pub interval_steps: u8,
}

impl TransmitParams {
    #[inline]
    pub fn interval_ms(&self) -> u64 {
        (u64::from(self.interval_steps) + 1) * 10
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransmitConfig {
    #[serde(rename = "DefaultTtl")]
    pub default_ttl: u8,
    #[serde(rename = "NetworkTransmit")]
    pub network_transmit: TransmitParams,
    #[serde(rename = "RelayRetransmit")]
    pub relay_retransmit: TransmitParams,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FriendshipConfig {
    /// Receive Window offered when acting as a Friend, in milliseconds.
    #[serde(rename = "RecvWindowMs")]
    pub recv_window_ms: u8,
    /// Receive Delay requested when acting as an LPN, in milliseconds.
    #[serde(rename = "RecvDelayMs")]
    pub recv_delay_ms: u8,
    /// Poll Timeout requested when acting as an LPN, in 100 ms units.
    #[serde(rename = "PollTimeout")]
    pub poll_timeout: u32,
    /// LPN sleep between polls, in milliseconds.
    #[serde(rename = "SleepDurationMs")]
    pub sleep_duration_ms: u64,
    #[serde(rename = "MinQueueSizeLog")]
    pub min_queue_size_log: u8,
    #[serde(rename = "RssiFactor")]
    pub rssi_factor: u8,
    #[serde(rename = "RecvWinFactor")]
    pub recv_win_factor: u8,
    /// Friend Request rounds before the LPN gives up establishing.
    #[serde(rename = "EstablishRetryCount")]
    pub establish_retry_count: u8,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Sequence numbers are persisted every this many allocations.
    #[serde(rename = "SeqNumberThreshold")]
    pub seq_number_threshold: u32,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks every boot-time invariant the stack depends on.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.elements.is_empty(), "at least one element is required");
        ensure!(
            self.elements.len() <= u8::MAX as usize,
            "too many elements: {}",
            self.elements.len()
        );

        let s = &self.sizes;
        ensure!(s.rp_list_size >= RP_MIN_LIST_SIZE, "RpListSize must be >= 1");
        ensure!(
            s.nwk_cache_l1_size >= NWK_CACHE_MIN_SIZE
                && s.nwk_cache_l2_size >= NWK_CACHE_MIN_SIZE,
            "network cache levels must hold at least {NWK_CACHE_MIN_SIZE} entries"
        );
        ensure!(s.net_key_list_size >= 1, "NetKeyListSize must be >= 1");
        ensure!(s.sar_rx_tran_info_size >= 1, "SarRxTranInfoSize must be >= 1");
        ensure!(s.sar_tx_max_transactions >= 1, "SarTxMaxTransactions must be >= 1");
        ensure!(
            s.max_num_friend_queue_entries >= 2,
            "a Friend Queue needs room for an Update and a data PDU"
        );

        let t = &self.transmit;
        ensure!(t.default_ttl <= TTL_MAX, "DefaultTtl must fit 7 bits");
        ensure!(t.default_ttl != 1, "DefaultTtl 1 is prohibited");
        ensure!(
            t.network_transmit.count <= TRANSMIT_COUNT_MAX
                && t.relay_retransmit.count <= TRANSMIT_COUNT_MAX,
            "transmit counts are 3-bit fields"
        );

        let f = &self.friendship;
        if self.features.friend.is_supported() {
            ensure!(f.recv_window_ms != 0, "RecvWindowMs 0 is prohibited");
        }
        if self.features.low_power.is_supported() {
            ensure!(
                f.recv_delay_ms >= RECV_DELAY_MS_MIN,
                "RecvDelayMs below protocol minimum"
            );
            ensure!(
                (POLL_TIMEOUT_MIN..=POLL_TIMEOUT_MAX).contains(&f.poll_timeout),
                "PollTimeout out of range"
            );
            ensure!(
                (1..=7).contains(&f.min_queue_size_log),
                "MinQueueSizeLog must be 1..=7"
            );
            ensure!(
                f.rssi_factor <= 3 && f.recv_win_factor <= 3,
                "criteria factors are 2-bit fields"
            );
            // The poll timeout must outlast a full sleep plus every retry's
            // receive delay and the widest possible receive window.
            let worst_cycle_ms = f.sleep_duration_ms
                + 4 * (u64::from(f.recv_delay_ms) + u64::from(u8::MAX));
            ensure!(
                u64::from(f.poll_timeout) * 100 > worst_cycle_ms,
                "PollTimeout too short for the polling cadence"
            );
        }

        ensure!(
            self.runtime.seq_number_threshold > 0,
            "SeqNumberThreshold must be > 0"
        );

        for (idx, elem) in self.elements.iter().enumerate() {
            ensure!(
                !elem.sig_models.is_empty() || !elem.vendor_models.is_empty(),
                "element {idx} declares no models"
            );
        }
        Ok(())
    }

    /// Number of elements, bounded by the u8 check in [`Config::validate`].
    #[inline]
    pub fn element_count(&self) -> u8 {
        self.elements.len() as u8
    }
}

/// Small-node configuration used across the crate's unit tests.
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        sizes: SizesConfig {
            addr_list_max_size: 8,
            virtual_addr_list_max_size: 4,
            app_key_list_size: 4,
            net_key_list_size: 4,
            nwk_cache_l1_size: 4,
            nwk_cache_l2_size: 8,
            max_num_friendships: 2,
            max_friend_subscr_list_size: 8,
            max_num_friend_queue_entries: 4,
            sar_rx_tran_history_size: 4,
            sar_rx_tran_info_size: 2,
            sar_tx_max_transactions: 2,
            rp_list_size: 8,
            nwk_output_filter_size: 4,
        },
        elements: vec![ElementConfig {
            location: 0x0001,
            sig_models: vec![0x1000],
            vendor_models: vec![],
            subscr_list_size: 4,
            app_key_bind_list_size: 2,
        }],
        features: FeaturesConfig::default(),
        transmit: TransmitConfig {
            default_ttl: 5,
            network_transmit: TransmitParams { count: 2, interval_steps: 1 },
            relay_retransmit: TransmitParams { count: 1, interval_steps: 1 },
        },
        friendship: FriendshipConfig {
            recv_window_ms: 50,
            recv_delay_ms: 100,
            poll_timeout: 0x000BB8,
            sleep_duration_ms: 5000,
            min_queue_size_log: 2,
            rssi_factor: 0,
            recv_win_factor: 0,
            establish_retry_count: 2,
        },
        runtime: RuntimeConfig { seq_number_threshold: 0x40 },
    }
}
