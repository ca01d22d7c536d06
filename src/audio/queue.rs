use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::{collections::VecDeque, time::Duration};
use tracing::{debug, info};

use crate::{
    error::CommandError,
    sources::{TrackDescriptor, TrackSummary},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

/// Cola FIFO de una sesión más el track en curso.
///
/// `current` nunca está también en `pending`: `pop` consume la cabeza.
#[derive(Debug)]
pub struct PlaybackQueue {
    pending: VecDeque<TrackDescriptor>,
    current: Option<TrackDescriptor>,
    loop_mode: LoopMode,
    max_size: usize,
}

impl PlaybackQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            loop_mode: LoopMode::Off,
            max_size,
        }
    }

    /// Agrega un track al final de la cola
    pub fn enqueue(&mut self, track: TrackDescriptor) -> Result<(), CommandError> {
        if self.pending.len() >= self.max_size {
            return Err(CommandError::QueueFull { max: self.max_size });
        }

        info!("➕ Agregado a la cola: {}", track.title());
        self.pending.push_back(track);
        Ok(())
    }

    /// Agrega múltiples tracks (playlist); lo que no cabe se descarta
    pub fn enqueue_many(&mut self, tracks: Vec<TrackDescriptor>) -> Result<Vec<TrackDescriptor>, CommandError> {
        let available_space = self.max_size.saturating_sub(self.pending.len());
        if available_space == 0 && !tracks.is_empty() {
            return Err(CommandError::QueueFull { max: self.max_size });
        }

        let added: Vec<TrackDescriptor> = tracks.into_iter().take(available_space).collect();
        self.pending.extend(added.iter().cloned());

        info!("➕ Agregadas {} canciones a la cola", added.len());
        Ok(added)
    }

    /// Elimina el track pendiente en `index` (0 = el siguiente)
    pub fn remove_at(&mut self, index: usize) -> Result<TrackDescriptor, CommandError> {
        let len = self.pending.len();
        let removed = self
            .pending
            .remove(index)
            .ok_or(CommandError::IndexOutOfRange { index, len })?;

        debug!("❌ Track eliminado en posición {}", index);
        Ok(removed)
    }

    /// Limpia la cola pendiente; el track en curso no se toca
    pub fn clear(&mut self) -> usize {
        let removed = self.pending.len();
        self.pending.clear();
        info!("🗑️ Cola limpiada ({} canciones)", removed);
        removed
    }

    /// Descarta hasta `count` tracks del frente de la cola pendiente
    pub fn drop_front(&mut self, count: usize) -> usize {
        let dropped = count.min(self.pending.len());
        self.pending.drain(..dropped);
        dropped
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Repetición desactivada"),
            LoopMode::Track => info!("🔂 Repetir canción activado"),
            LoopMode::Queue => info!("🔁 Repetir cola activado"),
        }
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn peek_next(&self) -> Option<&TrackDescriptor> {
        self.pending.front()
    }

    /// Saca la cabeza (FIFO estricto) y la marca como track en curso
    pub fn pop(&mut self) -> Option<TrackDescriptor> {
        let next = self.pending.pop_front()?;
        debug!("➡️ Siguiente en cola (FIFO): {}", next.title());
        self.current = Some(next.clone());
        Some(next)
    }

    /// El track en curso terminó normalmente: aplica la política de loop
    pub fn finish_current(&mut self) {
        let Some(finished) = self.current.take() else {
            return;
        };

        match self.loop_mode {
            LoopMode::Off => {}
            LoopMode::Track => {
                debug!("🔂 Repitiendo track: {}", finished.title());
                self.pending.push_front(finished);
            }
            LoopMode::Queue => {
                debug!("🔁 Track agregado al final por loop de cola: {}", finished.title());
                self.pending.push_back(finished);
            }
        }
    }

    /// Descarta el track en curso sin aplicar loop (skip, stop, errores)
    pub fn discard_current(&mut self) -> Option<TrackDescriptor> {
        self.current.take()
    }

    pub fn current(&self) -> Option<&TrackDescriptor> {
        self.current.as_ref()
    }

    /// Mueve un track a una nueva posición
    pub fn move_track(&mut self, from: usize, to: usize) -> Result<(), CommandError> {
        let len = self.pending.len();
        if from >= len {
            return Err(CommandError::IndexOutOfRange { index: from, len });
        }
        if to >= len {
            return Err(CommandError::IndexOutOfRange { index: to, len });
        }

        if from != to {
            if let Some(item) = self.pending.remove(from) {
                self.pending.insert(to, item);
            }
            debug!("📍 Track movido de posición {} a {}", from, to);
        }
        Ok(())
    }

    /// Mezcla la cola pendiente
    pub fn shuffle(&mut self) {
        self.pending.make_contiguous().shuffle(&mut rand::thread_rng());
        info!("🔀 Cola mezclada");
    }

    /// Limpia tracks de un usuario específico
    pub fn remove_by_requester(&mut self, user_id: UserId) -> usize {
        let original_len = self.pending.len();
        self.pending.retain(|track| track.requested_by() != user_id);

        let removed = original_len - self.pending.len();
        if removed > 0 {
            info!("🗑️ Eliminadas {} canciones del usuario", removed);
        }
        removed
    }

    pub fn list(&self) -> Vec<TrackSummary> {
        self.pending.iter().map(TrackDescriptor::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Obtiene una página específica de la cola (páginas desde 1)
    pub fn page(&self, page: usize, items_per_page: usize) -> QueuePage {
        let per_page = items_per_page.max(1);
        let total_items = self.pending.len();
        let total_pages = total_items.div_ceil(per_page).max(1);
        let current_page = page.clamp(1, total_pages);
        let start = (current_page - 1) * per_page;

        QueuePage {
            items: self
                .pending
                .iter()
                .skip(start)
                .take(per_page)
                .map(TrackDescriptor::summary)
                .collect(),
            current_page,
            total_pages,
            total_items,
        }
    }

    /// Duración conocida de lo pendiente más el track en curso
    pub fn total_duration(&self) -> Duration {
        self.pending
            .iter()
            .chain(self.current.iter())
            .filter_map(TrackDescriptor::duration)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuePage {
    pub items: Vec<TrackSummary>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}
