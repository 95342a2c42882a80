// SPDX-License-Identifier: MPL-2.0

pub(crate) use crate::{
    dispatch::{Action, Channel, ChannelId, ChannelModule, Channels, ModuleId, ModuleRequest, Payload},
    error::{Errno::*, Error},
    layers::bio::{BLOCK_SIZE, Block, INVALID_PBA, Pba},
    payload_of, return_errno, return_errno_with_msg,
    util::Hash,
};

pub(crate) type Result<T> = core::result::Result<T, Error>;

pub(crate) use core::fmt::{self, Debug};

pub(crate) use log::{debug, error, info, trace, warn};
