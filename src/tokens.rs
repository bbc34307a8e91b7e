//-
// Copyright (c) 2016, 2017, 2021, Jason Lingle
//
// This file is part of Metanode.
//
// Metanode is free software: you can redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Metanode is distributed  in the hope that it will be useful,  but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Metanode. If not, see <http://www.gnu.org/licenses/>.

//! Management of the symmetric keys behind block-access tokens.
//!
//! Every namenode replica shares the key table through the storage layer,
//! but only the elected leader ever writes it; followers re-read the
//! current/next keys when told a rotation happened. Tokens embed the id of
//! the key that signed them and are verified by id, not by role, so a token
//! stays verifiable through one full rotation even though its key has been
//! demoted to a simple (retired) key by then.
//!
//! Expiry dates are deliberately generous: the current key outlives its own
//! tenure by a full update interval plus the token lifetime, so replicas
//! and clients that lag a rotation still hold a verifiable key.

use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use rand::RngCore;
use tiny_keccak::Keccak;

use crate::defs::*;
use crate::errors::*;
use crate::log::{Log, Logger, INFO};
use crate::model::{BlockKey, KeyType};
use crate::storage::*;
use crate::txn::{run_light, run_transaction};

const SECRET_LEN: usize = 32;

/// What a block token authorises its bearer to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Copy,
    Replace,
}

impl AccessMode {
    fn bit(self) -> u32 {
        match self {
            AccessMode::Read => 1,
            AccessMode::Write => 2,
            AccessMode::Copy => 4,
            AccessMode::Replace => 8,
        }
    }

    fn name(self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::Copy => "copy",
            AccessMode::Replace => "replace",
        }
    }
}

fn mode_mask(modes: &[AccessMode]) -> u32 {
    modes.iter().fold(0, |mask, m| mask | m.bit())
}

/// The signed portion of a block token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockTokenIdentifier {
    pub expiry_date: Timestamp,
    pub key_id: KeyId,
    pub user_id: String,
    pub block_id: BlockId,
    pub modes: u32,
}

fourleaf_retrofit!(struct BlockTokenIdentifier : {} {} {
    |_context, this|
    [1] expiry_date: i64 = this.expiry_date,
    [2] key_id: i32 = this.key_id,
    [3] user_id: String = &this.user_id,
    [4] block_id: i64 = this.block_id,
    [5] modes: u32 = this.modes,
    { Ok(BlockTokenIdentifier { expiry_date: expiry_date, key_id: key_id,
                                user_id: user_id, block_id: block_id,
                                modes: modes }) }
});

/// A credential a client presents to a storage node: the serialised
/// identifier plus its MAC under the issuing key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockToken {
    pub identifier: Vec<u8>,
    pub password: Vec<u8>,
}

/// Key material exported to storage nodes during heartbeats.
#[derive(Clone, Debug)]
pub struct ExportedBlockKeys {
    pub key_update_interval: i64,
    pub token_lifetime: i64,
    pub current: Option<BlockKey>,
    pub keys: Vec<BlockKey>,
}

fn sign(data: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = [0u8; SECRET_LEN];
    let mut kc = Keccak::new_sha3_256();
    kc.update(data);
    kc.update(secret);
    kc.finalize(&mut mac);
    mac.to_vec()
}

fn generate_secret() -> Vec<u8> {
    let mut secret = vec![0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut secret);
    secret
}

struct KeyState {
    serial: KeyId,
    current: Option<BlockKey>,
    next: Option<BlockKey>,
    last_rotation: Timestamp,
}

pub struct BlockTokenSecretManager {
    storage: Arc<dyn Storage>,
    logger: Arc<dyn Logger + Send + Sync>,
    /// How often the leader rotates keys, in milliseconds. Must be long
    /// enough that every replica and storage node syncs at least once per
    /// interval.
    key_update_interval: i64,
    /// Validity of an issued token, in milliseconds.
    token_lifetime: i64,
    /// The serial counter and cached current/next keys must move together
    /// with the store, so every key-mutating path runs under this one lock.
    /// Cross-process exclusion is by convention: only the leader writes.
    state: Mutex<KeyState>,
}

impl BlockTokenSecretManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        logger: Arc<dyn Logger + Send + Sync>,
        key_update_interval: i64,
        token_lifetime: i64,
    ) -> Self {
        let mut seed = [0u8; 4];
        OsRng.fill_bytes(&mut seed);
        BlockTokenSecretManager {
            storage,
            logger,
            key_update_interval,
            token_lifetime,
            state: Mutex::new(KeyState {
                serial: KeyId::from_le_bytes(seed),
                current: None,
                next: None,
                last_rotation: 0,
            }),
        }
    }

    /// Brings the key schedule up. The leader wipes whatever keys a previous
    /// incarnation left behind and generates a fresh current/next pair;
    /// followers just read what the leader wrote.
    pub fn activate(&self, is_leader: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !is_leader {
            return self.read_keys(&mut state);
        }

        let now = now_millis();
        state.serial = state.serial.wrapping_add(1);
        let current = BlockKey {
            key_id: state.serial,
            expiry_date: now + 2 * self.key_update_interval
                + self.token_lifetime,
            key_type: KeyType::Current,
            key: generate_secret(),
        };
        state.serial = state.serial.wrapping_add(1);
        let next = BlockKey {
            key_id: state.serial,
            expiry_date: now + 3 * self.key_update_interval
                + self.token_lifetime,
            key_type: KeyType::Next,
            key: generate_secret(),
        };

        run_transaction(
            &self.storage,
            &*self.logger,
            "activate_block_keys",
            |ctx| {
                ctx.write_lock()?;
                for key in ctx.find_all_keys()? {
                    ctx.remove_key(key);
                }
                ctx.add_key(current.clone());
                ctx.add_key(next.clone());
                Ok(())
            },
        )?;

        state.current = Some(current);
        state.next = Some(next);
        state.last_rotation = now;
        Ok(())
    }

    /// Rotates if the update interval has elapsed since the last rotation.
    /// Returns whether a rotation (or follower refresh) happened.
    pub fn update_keys_if_needed(&self, is_leader: bool) -> Result<bool> {
        let elapsed = {
            let state = self.state.lock().unwrap();
            now_millis() - state.last_rotation
        };
        if elapsed <= self.key_update_interval {
            return Ok(false);
        }
        self.update_keys(is_leader)?;
        Ok(true)
    }

    /// Leader-side rotation: drop dead keys, demote current to simple with
    /// one more interval of verification life, promote next, generate a new
    /// next. Followers fall through to a read-only refresh.
    pub fn update_keys(&self, is_leader: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !is_leader {
            return self.read_keys(&mut state);
        }

        let now = now_millis();
        run_transaction(
            &self.storage,
            &*self.logger,
            "remove_expired_block_keys",
            |ctx| {
                ctx.write_lock()?;
                for key in ctx.find_all_keys()? {
                    if key.is_expired(now) {
                        ctx.remove_key(key);
                    }
                }
                Ok(())
            },
        )?;

        state.serial = state.serial.wrapping_add(1);
        let fresh = BlockKey {
            key_id: state.serial,
            expiry_date: now + 3 * self.key_update_interval
                + self.token_lifetime,
            key_type: KeyType::Next,
            key: generate_secret(),
        };

        let interval = self.key_update_interval;
        let lifetime = self.token_lifetime;
        let (retired_id, promoted) = run_transaction(
            &self.storage,
            &*self.logger,
            "rotate_block_keys",
            |ctx| {
                ctx.write_lock()?;
                let current = ctx
                    .find_key_by_type(KeyType::Current)?
                    .ok_or(ErrorKind::KeysNotInitialized)?;
                let next = ctx
                    .find_key_by_type(KeyType::Next)?
                    .ok_or(ErrorKind::KeysNotInitialized)?;

                // Tokens the retiring key signed stay verifiable for one
                // more interval plus the token lifetime.
                let mut retired = current.clone();
                retired.key_type = KeyType::Simple;
                retired.expiry_date = now + interval + lifetime;
                ctx.update_key(retired);

                let mut promoted = next;
                promoted.key_type = KeyType::Current;
                promoted.expiry_date = now + 2 * interval + lifetime;
                ctx.update_key(promoted.clone());

                ctx.add_key(fresh.clone());
                Ok((current.key_id, promoted))
            },
        )?;

        self.logger
            .log(INFO, &Log::KeyRotation(retired_id, promoted.key_id));
        state.current = Some(promoted);
        state.next = Some(fresh);
        state.last_rotation = now;
        Ok(())
    }

    /// Follower-side refresh after a rotation signal; never writes.
    pub fn refresh_keys(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.read_keys(&mut state)?;
        if let (Some(ref c), Some(ref n)) = (&state.current, &state.next) {
            self.logger
                .log(INFO, &Log::KeysRefreshed(c.key_id, n.key_id));
        }
        Ok(())
    }

    fn read_keys(&self, state: &mut KeyState) -> Result<()> {
        state.current = run_light(&self.storage, |s| {
            s.key_by_type(KeyType::Current)
        })?;
        state.next =
            run_light(&self.storage, |s| s.key_by_type(KeyType::Next))?;
        state.last_rotation = now_millis();
        Ok(())
    }

    /// Issues a token for `user_id` to access `block_id` with `modes`,
    /// signed by the current key.
    pub fn generate_token(
        &self,
        user_id: &str,
        block_id: BlockId,
        modes: &[AccessMode],
    ) -> Result<BlockToken> {
        let state = self.state.lock().unwrap();
        let current = state
            .current
            .as_ref()
            .ok_or(ErrorKind::KeysNotInitialized)?;

        let identifier = BlockTokenIdentifier {
            expiry_date: now_millis() + self.token_lifetime,
            key_id: current.key_id,
            user_id: user_id.to_owned(),
            block_id,
            modes: mode_mask(modes),
        };
        let bytes = fourleaf::to_vec(&identifier)?;
        let password = sign(&bytes, &current.key);
        Ok(BlockToken {
            identifier: bytes,
            password,
        })
    }

    /// Verifies that `token` authorises `user_id` (unchecked if `None`) to
    /// perform `mode` on `block_id`.
    ///
    /// The signing key is looked up by id so that tokens issued before the
    /// last rotation still verify; each failure condition is distinct, and
    /// all of them are terminal — a bad token is never retried.
    pub fn check_access(
        &self,
        token: &BlockToken,
        user_id: Option<&str>,
        block_id: BlockId,
        mode: AccessMode,
    ) -> Result<()> {
        let config = fourleaf::DeConfig::default();
        // A token that does not even parse is treated as a bad signature.
        let identifier: BlockTokenIdentifier =
            fourleaf::from_slice_copy(&token.identifier, &config)
                .map_err(|_| Error::from(ErrorKind::TokenSignatureMismatch))?;

        if let Some(user) = user_id {
            if user != identifier.user_id {
                return Err(
                    ErrorKind::TokenUserMismatch(user.to_owned()).into()
                );
            }
        }
        if identifier.block_id != block_id {
            return Err(ErrorKind::TokenBlockMismatch(
                block_id,
                identifier.block_id,
            )
            .into());
        }
        let now = now_millis();
        if now > identifier.expiry_date {
            return Err(ErrorKind::TokenExpired(identifier.expiry_date)
                .into());
        }
        if 0 == identifier.modes & mode.bit() {
            return Err(ErrorKind::TokenAccessModeDenied(
                mode.name().to_owned(),
            )
            .into());
        }

        let key_id = identifier.key_id;
        let key = run_light(&self.storage, |s| s.key_by_id(key_id))?
            .ok_or(ErrorKind::TokenKeyNotFound(key_id))?;
        if key.is_expired(now) {
            return Err(ErrorKind::TokenExpired(key.expiry_date).into());
        }

        if sign(&token.identifier, &key.key) != token.password {
            return Err(ErrorKind::TokenSignatureMismatch.into());
        }
        Ok(())
    }

    /// The current key plus every unexpired key, for syncing storage nodes.
    pub fn export_keys(&self) -> Result<ExportedBlockKeys> {
        let now = now_millis();
        let keys = run_light(&self.storage, |s| s.all_keys())?
            .into_iter()
            .filter(|k| !k.is_expired(now))
            .collect::<Vec<_>>();
        let current = keys
            .iter()
            .find(|k| KeyType::Current == k.key_type)
            .cloned();
        Ok(ExportedBlockKeys {
            key_update_interval: self.key_update_interval,
            token_lifetime: self.token_lifetime,
            current,
            keys,
        })
    }
}
