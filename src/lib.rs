// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod config;
pub mod daemon;
pub mod history;
pub mod logging;
pub mod ot;
pub mod server;
pub mod shadow;
pub mod transport;
pub mod types;
pub mod wire;
