// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Configuration of changefeeds, the owner and the processor sorter.
//!
//! Loading configuration from files is not handled here. Every struct has a [`Default`]
//! and a builder, and (de)serializes with kebab-case keys.

mod owner;
mod replica;
mod sorter;

pub use owner::*;
pub use replica::*;
pub use sorter::*;
