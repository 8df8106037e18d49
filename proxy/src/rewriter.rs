//! Entity id translation across backend switches.
//!
//! The client keeps the entity id it learned from the first StartGame for
//! the whole connection. After a switch the new backend knows the player by
//! a different id, so packets naming "the player" are translated in both
//! directions.

use bytes::Bytes;
use log::debug;
use protocol::mcpe::{self, Batch, StartGame};
use protocol::Packet;

/// Packets whose big-endian entity id immediately follows the packet id byte.
const ENTITY_ID_AT_ONE: [u8; 3] = [mcpe::ID_ANIMATE, mcpe::ID_MOVE_PLAYER, mcpe::ID_ENTITY_EVENT];
/// id, seed, dimension, generator, gamemode precede the entity id.
const START_GAME_ENTITY_ID: std::ops::Range<usize> = 14..22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityIdRewriter {
    client_id: i64,
    server_id: i64,
}

impl EntityIdRewriter {
    pub fn new(initial_id: i64) -> Self {
        Self {
            client_id: initial_id,
            server_id: initial_id,
        }
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    pub fn server_id(&self) -> i64 {
        self.server_id
    }

    pub fn set_new_server_id(&mut self, server_id: i64) {
        self.server_id = server_id;
    }

    fn is_identity(&self) -> bool {
        self.client_id == self.server_id
    }

    fn swap_id(packet: &mut [u8], from: i64, to: i64) -> bool {
        let Some(&id) = packet.first() else {
            return false;
        };
        if !ENTITY_ID_AT_ONE.contains(&id) || packet.len() < 9 {
            return false;
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&packet[1..9]);
        if i64::from_be_bytes(raw) != from {
            return false;
        }
        packet[1..9].copy_from_slice(&to.to_be_bytes());
        true
    }

    /// Client-bound: replaces the backend's id with the client's id in place.
    pub fn rewrite_bytes(&self, packet: &mut [u8]) -> bool {
        Self::swap_id(packet, self.server_id, self.client_id)
    }

    /// Server-bound: replaces the client's id with the current backend id in place.
    pub fn rewrite_server_bound_bytes(&self, packet: &mut [u8]) -> bool {
        Self::swap_id(packet, self.client_id, self.server_id)
    }

    pub fn rewrite_packet(&self, mut start_game: StartGame) -> StartGame {
        if start_game.entity_id == self.server_id {
            start_game.entity_id = self.client_id;
        }
        start_game
    }

    /// Rewrites one client-bound application payload, descending into batches.
    ///
    /// Payloads that need no change come back untouched, including batches
    /// that fail to decode.
    pub fn rewrite_client_bound(&self, payload: Bytes) -> Bytes {
        if self.is_identity() {
            return payload;
        }
        self.rewrite(payload, |rewriter, packet| {
            if packet.first() == Some(&mcpe::ID_START_GAME) {
                return match StartGame::decode(packet) {
                    Ok(start_game) => {
                        let rewritten = rewriter.rewrite_packet(start_game);
                        if rewritten.entity_id == start_game.entity_id {
                            return false;
                        }
                        packet[START_GAME_ENTITY_ID]
                            .copy_from_slice(&rewritten.entity_id.to_be_bytes());
                        true
                    }
                    Err(_) => false,
                };
            }
            rewriter.rewrite_bytes(packet)
        })
    }

    pub fn rewrite_server_bound(&self, payload: Bytes) -> Bytes {
        if self.is_identity() {
            return payload;
        }
        self.rewrite(payload, |rewriter, packet| rewriter.rewrite_server_bound_bytes(packet))
    }

    fn rewrite(&self, payload: Bytes, edit: impl Fn(&Self, &mut [u8]) -> bool) -> Bytes {
        if payload.first() != Some(&mcpe::ID_BATCH) {
            let mut packet = payload.to_vec();
            return if edit(self, &mut packet) {
                Bytes::from(packet)
            } else {
                payload
            };
        }

        let batch = match Batch::decode(&payload) {
            Ok(batch) => batch,
            Err(e) => {
                debug!("Passing through undecodable batch: {}", e);
                return payload;
            }
        };
        let mut changed = false;
        let packets = batch
            .packets
            .into_iter()
            .map(|packet| {
                let mut raw = packet.to_vec();
                if edit(self, &mut raw) {
                    changed = true;
                    Bytes::from(raw)
                } else {
                    packet
                }
            })
            .collect();
        if !changed {
            return payload;
        }
        match Batch::new(packets).encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                debug!("Failed to re-compress batch: {}", e);
                payload
            }
        }
    }
}
