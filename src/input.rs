// 该文件是 Nanfeng （南风） 项目的一部分。
// src/input.rs - 评估输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use thiserror::Error;

use crate::FromUrl;

#[cfg(feature = "replay_input")]
mod replay;
#[cfg(feature = "replay_input")]
pub use self::replay::{
  ReplayBatch, ReplayDataset, ReplayError, ReplayInput, ReplayModel, ReplaySample,
};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "replay_input")]
  #[error("回放输入错误: {0}")]
  ReplayError(#[from] ReplayError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

pub enum InputWrapper {
  #[cfg(feature = "replay_input")]
  Replay(ReplayInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "replay_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ReplayInput::SCHEME {
        let input = ReplayInput::from_url(url)?;
        return Ok(InputWrapper::Replay(input));
      }
    }
    Err(InputError::SchemeMismatch)
  }
}
