// SPDX-License-Identifier: Apache-2.0

pub mod buffer;
pub mod dispatcher;
pub mod event;
