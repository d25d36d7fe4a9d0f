use std::cell::RefCell;
use std::rc::Rc;

use mlua::{IntoLuaMulti, Value};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::lua::{integral, number, raise, ModuleBuilder, ScriptVm};

pub const RANDOM_MODULE: &str = "lab.system.random";

/// Mix the per-episode seed with the per-instance mixer so parallel
/// environments started with the same episode seed diverge.
pub fn mix_seed(seed: i32, mixer: u32) -> u64 {
    (u64::from(mixer) << 32) ^ u64::from(seed as u32)
}

/// The episode's pseudo-random bit generator.
#[derive(Debug)]
pub struct Prbg {
    rng: StdRng,
}

impl Default for Prbg {
    fn default() -> Self {
        Self::from_seed(0)
    }
}

impl Prbg {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Uniform integer in `[low, high]`.
    pub fn uniform_int(&mut self, low: i64, high: i64) -> Option<i64> {
        (low <= high).then(|| self.rng.gen_range(low..=high))
    }

    /// Uniform real in `[low, high)`; `low` itself when the range is empty.
    pub fn uniform_real(&mut self, low: f64, high: f64) -> Option<f64> {
        if low.is_nan() || high.is_nan() || low > high {
            return None;
        }
        if low == high {
            return Some(low);
        }
        Some(self.rng.gen_range(low..high))
    }

    /// Draw a seed for engine-side randomness.
    pub fn next_seed(&mut self) -> i32 {
        self.rng.gen_range(0..=i32::MAX)
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }
}

/// Register `lab.system.random` over the context's generator.
pub fn install(vm: &ScriptVm, prbg: Rc<RefCell<Prbg>>) {
    vm.add_native_module(RANDOM_MODULE, move |lua| {
        let module = ModuleBuilder::new(lua)?;

        let rng = prbg.clone();
        module.function("uniformInt", move |lua, args| {
            let (low, high) = match (args.first().and_then(integral), args.get(1).and_then(integral)) {
                (Some(low), Some(high)) => (low, high),
                _ => return Err(raise("[random.uniformInt] - Must be called with two integers")),
            };
            let value = rng.borrow_mut().uniform_int(low, high).ok_or_else(|| {
                raise(format!("[random.uniformInt] - Empty range [{low}, {high}]"))
            })?;
            value.into_lua_multi(lua)
        })?;

        let rng = prbg.clone();
        module.function("uniformReal", move |lua, args| {
            let (low, high) = match (args.first().and_then(number), args.get(1).and_then(number)) {
                (Some(low), Some(high)) => (low, high),
                _ => return Err(raise("[random.uniformReal] - Must be called with two numbers")),
            };
            let value = rng.borrow_mut().uniform_real(low, high).ok_or_else(|| {
                raise(format!("[random.uniformReal] - Empty range [{low}, {high})"))
            })?;
            value.into_lua_multi(lua)
        })?;

        let rng = prbg.clone();
        module.function("seed", move |lua, args| {
            let seed = args
                .first()
                .and_then(integral)
                .ok_or_else(|| raise("[random.seed] - Seed must be an integer"))?;
            rng.borrow_mut().reseed(seed as u64);
            ().into_lua_multi(lua)
        })?;

        let rng = prbg.clone();
        module.function("shuffle", move |lua, args| {
            let Some(Value::Table(table)) = args.first() else {
                return Err(raise("[random.shuffle] - Argument must be an array"));
            };
            let mut items = table
                .clone()
                .sequence_values::<Value>()
                .collect::<mlua::Result<Vec<_>>>()?;
            rng.borrow_mut().shuffle(&mut items);
            for (index, item) in items.into_iter().enumerate() {
                table.raw_set(index + 1, item)?;
            }
            Value::Table(table.clone()).into_lua_multi(lua)
        })?;

        Ok(module.finish())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::error_message;

    #[test]
    fn mixer_goes_in_the_high_word() {
        assert_eq!(mix_seed(5, 0), 5);
        assert_eq!(mix_seed(5, 1), (1 << 32) | 5);
        assert_eq!(mix_seed(-1, 0), u64::from(u32::MAX));
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Prbg::from_seed(mix_seed(7, 3));
        let mut b = Prbg::default();
        b.reseed(mix_seed(7, 3));
        for _ in 0..16 {
            assert_eq!(a.uniform_int(1, 6), b.uniform_int(1, 6));
        }
        assert!(a.next_seed() >= 0);
        assert_eq!(a.uniform_int(2, 1), None);
        assert_eq!(a.uniform_real(1.5, 1.5), Some(1.5));
    }

    #[test]
    fn script_module_draws_from_the_shared_generator() {
        let vm = ScriptVm::new().expect("vm");
        let prbg = Rc::new(RefCell::new(Prbg::default()));
        install(&vm, prbg);
        let ok: bool = vm
            .lua()
            .load(
                r#"
                local random = require 'lab.system.random'
                random:seed(11)
                for _ = 1, 100 do
                  local v = random.uniformInt(1, 3)
                  if v < 1 or v > 3 then return false end
                  local r = random:uniformReal(0, 1)
                  if r < 0 or r >= 1 then return false end
                end
                local t = random.shuffle({1, 2, 3, 4})
                local sum = 0
                for _, v in ipairs(t) do sum = sum + v end
                return #t == 4 and sum == 10
                "#,
            )
            .eval()
            .expect("script");
        assert!(ok);

        let err = vm
            .lua()
            .load("require('lab.system.random').uniformInt(3, 1)")
            .exec()
            .expect_err("empty range");
        assert_eq!(error_message(&err), "[random.uniformInt] - Empty range [3, 1]");
    }
}
