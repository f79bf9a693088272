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

//! Call Media Bridge: couples a PBX control plane to a streaming
//! conversational AI over WebSocket for the duration of one phone call.
//!
//! [`tracker`] is the only cross-call shared state; every other component is
//! constructed once in the binary entry point and handed around by `Arc` or
//! cheap clone, per the "no global singletons" design note.

pub mod admin;
pub mod ai;
pub mod codec;
pub mod config;
pub mod egress;
pub mod error;
pub mod ingress;
pub mod orchestrator;
pub mod pbx;
pub mod reconnect;
pub mod telemetry;
pub mod tracker;
pub mod transcript;
