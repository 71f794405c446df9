//! Channel pools: a cache of idle channels over one connection sharing
//! one profile, so callers can borrow a ready channel instead of paying
//! a `<start>` round-trip.

use std::sync::{Arc, Weak};

use tokio::sync::Mutex as AsyncMutex;

use crate::channel::{Channel, ChannelStatus};
use crate::connection::{Connection, ConnectionInner};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    id: u32,
    profile: String,
    conn: Weak<ConnectionInner>,
    // growth and teardown are serialized by this lock
    state: AsyncMutex<PoolState>,
}

struct PoolState {
    members: Vec<PoolMember>,
}

struct PoolMember {
    channel: Channel,
    busy: bool,
}

impl ChannelPool {
    /// Create a pool and start `initial` channels for it.
    pub async fn create(conn: &Connection, profile: &str, initial: usize) -> Result<ChannelPool> {
        let id = conn.inner.alloc_pool_id();
        let pool = ChannelPool {
            inner: Arc::new(PoolInner {
                id,
                profile: profile.to_string(),
                conn: Arc::downgrade(&conn.inner),
                state: AsyncMutex::new(PoolState {
                    members: Vec::new(),
                }),
            }),
        };

        {
            let mut state = pool.inner.state.lock().await;
            for _ in 0..initial {
                let channel = conn.start_channel(profile).await?;
                state.members.push(PoolMember {
                    channel,
                    busy: false,
                });
            }
        }

        conn.inner.store_pool(id, pool.clone());
        Ok(pool)
    }

    /// Look a pool up by id on its connection.
    pub fn find(conn: &Connection, id: u32) -> Option<ChannelPool> {
        conn.inner.find_pool(id)
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn profile(&self) -> &str {
        &self.inner.profile
    }

    pub fn connection(&self) -> Option<Connection> {
        self.inner.conn.upgrade().map(Connection::from_inner)
    }

    /// Borrow an idle ready channel, starting a new one when none is
    /// free and `auto_inc` is set. Dead channels found on the way are
    /// dropped from the pool.
    pub async fn get_next_ready(&self, auto_inc: bool) -> Result<Option<Channel>> {
        let conn = self
            .inner
            .conn
            .upgrade()
            .ok_or(Error::TransportClosed)
            .map(Connection::from_inner)?;

        let mut state = self.inner.state.lock().await;
        state
            .members
            .retain(|m| m.channel.status() != ChannelStatus::Dead);

        if let Some(member) = state
            .members
            .iter_mut()
            .find(|m| !m.busy && m.channel.is_ready())
        {
            member.busy = true;
            return Ok(Some(member.channel.clone()));
        }
        if !auto_inc {
            return Ok(None);
        }

        let channel = conn.start_channel(&self.inner.profile).await?;
        state.members.push(PoolMember {
            channel: channel.clone(),
            busy: true,
        });
        Ok(Some(channel))
    }

    /// Return a channel to the pool. Idempotent; releasing a channel
    /// that died removes it instead.
    pub async fn release(&self, channel: &Channel) {
        let mut state = self.inner.state.lock().await;
        if channel.status() == ChannelStatus::Dead {
            state
                .members
                .retain(|m| m.channel.number() != channel.number());
            return;
        }
        if let Some(member) = state
            .members
            .iter_mut()
            .find(|m| m.channel.number() == channel.number())
        {
            member.busy = false;
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.state.lock().await.members.len()
    }

    /// Channels that are idle right now.
    pub async fn channel_available(&self) -> usize {
        self.inner
            .state
            .lock()
            .await
            .members
            .iter()
            .filter(|m| !m.busy)
            .count()
    }

    /// Close every pooled channel and detach the pool from its
    /// connection. Serialized against concurrent growth.
    pub async fn close(&self) -> Result<()> {
        let conn = self.inner.conn.upgrade().map(Connection::from_inner);
        let mut state = self.inner.state.lock().await;
        if let Some(conn) = conn {
            for member in state.members.drain(..) {
                match conn.close_channel(member.channel.number()).await {
                    Ok(()) | Err(Error::ChannelClosed(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            conn.inner.drop_pool(self.inner.id);
        } else {
            state.members.clear();
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("id", &self.inner.id)
            .field("profile", &self.inner.profile)
            .finish_non_exhaustive()
    }
}
