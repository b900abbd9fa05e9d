//! CPU implementations of the cull and generate compute passes, executed by
//! the software backend in place of `sprite_cull.comp` and
//! `sprite_generate.comp`.
//!
//! Both run their thread groups in parallel. Survivors reserve visible-list
//! slots through a shared atomic counter, so slot order changes from run to
//! run exactly like on a GPU.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use super::geometry::{overlaps_viewport, quad_vertices};
use super::{slots, DrawCommand, SpriteVertex, SPRITE_VERTEX_COUNT};
use crate::backend::software::{ComputeKernel, Dispatch, KernelBinding};

/// Constants shared by both passes, in `cmd_set_constants` order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PassConstants {
    pub viewport: [f32; 2],
    pub command_count: u32,
    pub texture_base: u32,
}

impl PassConstants {
    pub fn to_words(self) -> [u32; 4] {
        [
            self.viewport[0].to_bits(),
            self.viewport[1].to_bits(),
            self.command_count,
            self.texture_base,
        ]
    }

    fn from_dispatch(dispatch: &Dispatch<'_>) -> Self {
        Self {
            viewport: [
                f32::from_bits(dispatch.constant(0)),
                f32::from_bits(dispatch.constant(1)),
            ],
            command_count: dispatch.constant(2),
            texture_base: dispatch.constant(3),
        }
    }
}

const COMMAND_WORDS: usize = std::mem::size_of::<DrawCommand>() / 4;
const QUAD_WORDS: usize = SPRITE_VERTEX_COUNT as usize * std::mem::size_of::<SpriteVertex>() / 4;

fn commands(words: &[u32], count: u32) -> Result<&[DrawCommand], String> {
    let words = words
        .get(..count as usize * COMMAND_WORDS)
        .ok_or_else(|| format!("command buffer holds fewer than {count} commands"))?;
    bytemuck::try_cast_slice(words).map_err(|e| e.to_string())
}

fn thread_count(dispatch: &Dispatch<'_>, group_size: u32) -> u64 {
    dispatch.groups.iter().map(|&g| g as u64).product::<u64>() * group_size as u64
}

/// Phase 1: viewport culling and compaction into the visible list.
#[derive(Debug)]
pub struct CullKernel {
    group_size: u32,
}

const CULL_BINDINGS: [KernelBinding; 4] = [
    KernelBinding {
        slot: slots::COMMANDS,
        writes: false,
    },
    KernelBinding {
        slot: slots::VISIBLE,
        writes: true,
    },
    KernelBinding {
        slot: slots::COUNTER,
        writes: true,
    },
    KernelBinding {
        slot: slots::ARGS,
        writes: true,
    },
];

impl CullKernel {
    pub fn new(group_size: u32) -> Self {
        Self { group_size }
    }
}

impl ComputeKernel for CullKernel {
    fn group_size(&self) -> u32 {
        self.group_size
    }

    fn bindings(&self) -> &[KernelBinding] {
        &CULL_BINDINGS
    }

    fn dispatch(&self, dispatch: Dispatch<'_>) -> Result<(), String> {
        let constants = PassConstants::from_dispatch(&dispatch);
        let threads = thread_count(&dispatch, self.group_size);
        let [command_words, visible, counter, args]: [&mut [u32]; 4] = dispatch
            .views
            .try_into()
            .map_err(|_| "cull expects four views".to_string())?;

        let commands = commands(command_words, constants.command_count)?;
        let live = (commands.len() as u64).min(threads) as u32;
        let reserved = AtomicU32::new(counter[0]);
        let [width, height] = constants.viewport;

        let group_size = self.group_size;
        let groups = live.div_ceil(group_size.max(1));
        let survivors: Vec<(u32, u32)> = (0..groups)
            .into_par_iter()
            .flat_map_iter(|group| {
                let first = group * group_size;
                let last = (first + group_size).min(live);
                let reserved = &reserved;
                (first..last).filter_map(move |index| {
                    overlaps_viewport(&commands[index as usize], width, height)
                        .then(|| (reserved.fetch_add(1, Ordering::Relaxed), index))
                })
            })
            .collect();

        for &(slot, index) in &survivors {
            let entry = visible
                .get_mut(slot as usize)
                .ok_or_else(|| format!("visible list overflow at slot {slot}"))?;
            *entry = index;
        }
        counter[0] = reserved.into_inner();
        args[0] += SPRITE_VERTEX_COUNT * survivors.len() as u32;
        Ok(())
    }
}

/// Phase 2: expansion of every visible-list slot into six vertices.
#[derive(Debug)]
pub struct GenerateKernel {
    group_size: u32,
}

const GENERATE_BINDINGS: [KernelBinding; 4] = [
    KernelBinding {
        slot: slots::COMMANDS,
        writes: false,
    },
    KernelBinding {
        slot: slots::VISIBLE,
        writes: false,
    },
    KernelBinding {
        slot: slots::COUNTER,
        writes: false,
    },
    KernelBinding {
        slot: slots::VERTICES,
        writes: true,
    },
];

impl GenerateKernel {
    pub fn new(group_size: u32) -> Self {
        Self { group_size }
    }
}

impl ComputeKernel for GenerateKernel {
    fn group_size(&self) -> u32 {
        self.group_size
    }

    fn bindings(&self) -> &[KernelBinding] {
        &GENERATE_BINDINGS
    }

    fn dispatch(&self, dispatch: Dispatch<'_>) -> Result<(), String> {
        let constants = PassConstants::from_dispatch(&dispatch);
        let threads = thread_count(&dispatch, self.group_size);
        let [command_words, visible, counter, vertices]: [&mut [u32]; 4] = dispatch
            .views
            .try_into()
            .map_err(|_| "generate expects four views".to_string())?;

        let commands = commands(command_words, constants.command_count)?;
        let occupied = (counter[0] as u64).min(threads) as usize;
        let visible = visible
            .get(..occupied)
            .ok_or_else(|| format!("visible list shorter than {occupied} slots"))?;
        let quads = vertices
            .get_mut(..occupied * QUAD_WORDS)
            .ok_or_else(|| format!("vertex buffer shorter than {occupied} quads"))?;

        quads
            .par_chunks_exact_mut(QUAD_WORDS)
            .zip(visible.par_iter())
            .try_for_each(|(quad, &index)| {
                let command = commands
                    .get(index as usize)
                    .ok_or_else(|| format!("visible entry {index} out of range"))?;
                let out: &mut [SpriteVertex] = bytemuck::cast_slice_mut(quad);
                out.copy_from_slice(&quad_vertices(command, constants.texture_base));
                Ok(())
            })
    }
}
