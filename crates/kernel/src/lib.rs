// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The node kernel: durable transactional task scheduling, the cluster-wide
//! identity-to-node mapping, and the intra-node scheduler/executor stack.
//!
//! A node embeds this by building a [`config::Config`], starting one
//! [`nodemap::NodeMappingServer`] somewhere in the cluster, and bringing a
//! [`runtime::NodeRuntime`] up against the shared store. Applications then
//! talk to [`tasks::TaskService`] to persist work that survives crashes and
//! follows its owning identity across nodes.

pub mod config;
pub mod nodemap;
pub mod runtime;
pub mod sched;
pub mod tasks;
mod util;

pub use runtime::NodeRuntime;
