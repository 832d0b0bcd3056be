// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Dotfile management through a source directory.
//!
//! Oxihome keeps the desired state of a user's home directory in a separate
//! __source directory__. Every entry of the source directory encodes what it
//! should become through attributes in its own name, e.g., `private_dot_ssh`
//! becomes `~/.ssh` with group and other permissions cleared.
//!
//! # Pipeline
//!
//! An apply always runs in three strictly sequential steps:
//!
//! 1. Walk the source directory into a [`SourceTree`].
//! 2. Compute the [`TargetState`] by decrypting and rendering entries.
//! 3. [`apply`] the target state to the destination directory.
//!
//! Nothing in the destination directory is touched unless the first two
//! steps succeed completely.
//!
//! [`SourceTree`]: crate::source::SourceTree
//! [`TargetState`]: crate::target::TargetState
//! [`apply`]: crate::apply::apply

pub mod apply;
pub mod attr;
pub mod config;
pub mod crypt;
pub mod path;
pub mod runstate;
pub mod source;
pub mod system;
pub mod target;
pub mod template;
