//! Simulation Tick
//!
//! Advances a frame by exactly one tick. Must stay 100% deterministic:
//! players are applied in input order, systems run in index order, and
//! parallel task results are applied in index order.

use std::sync::Arc;

use tracing::trace;

use crate::sim::events::RaisedEvent;
use crate::sim::frame::{Frame, FrameError};
use crate::sim::input::TickInputs;
use crate::sim::scheduler::TaskContext;

/// Result of a tick.
#[derive(Debug, Default)]
pub struct TickResult {
    /// Events raised this tick.
    pub events: Vec<RaisedEvent>,
    /// Tasks that returned an error.
    pub failed_tasks: usize,
    /// Heap allocations of this tick nothing references.
    pub leaks: usize,
}

/// Schedule and execute every system enabled in hierarchy. Returns the
/// number of failed tasks.
pub fn run_systems(frame: &mut Frame) -> usize {
    let context = Arc::clone(frame.context());
    context.profiler().begin_tick(frame.number());

    let mut tasks = TaskContext::new();
    let begin = tasks.begin();
    context.systems().schedule_all(frame, &mut tasks, begin);
    tasks.execute(frame, context.pool(), context.profiler())
}

/// Run one tick on `frame` with the confirmed or predicted `inputs`.
///
/// `inputs.tick` must be the tick after the frame's current number.
pub fn simulate(frame: &mut Frame, inputs: &TickInputs) -> Result<TickResult, FrameError> {
    let expected = frame.number() + 1;
    if inputs.tick != expected {
        return Err(FrameError::TickMismatch {
            expected,
            got: inputs.tick,
        });
    }

    frame.set_number(expected);
    frame.begin_tick(expected);
    frame.apply_inputs(inputs);

    for &player in &inputs.leaves {
        frame.remove_player(player);
    }
    for join in &inputs.joins {
        frame.add_player(join);
    }

    let failed_tasks = run_systems(frame);
    let leaks = frame.report_leaks();
    let events = frame.take_raised();
    trace!(
        tick = expected,
        verified = frame.is_verified(),
        events = events.len(),
        failed_tasks,
        "Simulated"
    );

    Ok(TickResult {
        events,
        failed_tasks,
        leaks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::ChecksumAccumulator;
    use crate::sim::context::tests::test_context_with;
    use crate::sim::entity::{Component, ComponentId};
    use crate::sim::events::{Event, EventTypeId};
    use crate::sim::input::{InputDecode, PlayerJoin};
    use crate::sim::scheduler::TaskHandle;
    use crate::sim::serializer::FrameSerializer;
    use crate::sim::system::{Signal, SignalKind, System, SystemDescriptor, SystemSetup};

    #[derive(Debug, Clone, Copy, PartialEq, Default)]
    struct Position(i32);

    impl Component for Position {
        const ID: ComponentId = 1;
        const SIZE: usize = 4;
        fn encode(&self, out: &mut [u8]) {
            out.copy_from_slice(&self.0.to_le_bytes());
        }
        fn decode(bytes: &[u8]) -> Self {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(bytes);
            Position(i32::from_le_bytes(raw))
        }
    }

    #[derive(Debug, Default, PartialEq)]
    struct Step(i8);

    impl InputDecode for Step {
        fn decode(bytes: &[u8]) -> Option<Self> {
            match bytes {
                [b] => Some(Step(*b as i8)),
                _ => None,
            }
        }
        fn encode(&self) -> Vec<u8> {
            vec![self.0 as u8]
        }
    }

    #[derive(Debug)]
    struct Moved {
        to: i32,
    }

    impl Event for Moved {
        const ID: EventTypeId = 1;
        fn hash_content(&self, hasher: &mut ChecksumAccumulator) {
            hasher.update_i32(self.to);
        }
    }

    /// Spawns one entity per joining player and moves it by its input.
    struct Walk;

    impl System for Walk {
        fn name(&self) -> &str {
            "Walk"
        }

        fn signals(&self) -> &[SignalKind] {
            &[SignalKind::PlayerAdded]
        }

        fn on_signal(&self, frame: &mut Frame, signal: &Signal) -> anyhow::Result<()> {
            if let Signal::PlayerAdded { .. } = signal {
                let e = frame.create()?;
                frame.add(e, Position(0))?;
            }
            Ok(())
        }

        fn update(&self, frame: &mut Frame) -> anyhow::Result<()> {
            let step = frame.input::<Step>(0).0 as i32;
            for e in frame.entities_with::<Position>() {
                let to = frame.get::<Position>(e)?.0 + step;
                frame.set(e, &Position(to))?;
                if step != 0 {
                    frame.raise(Moved { to });
                }
            }
            Ok(())
        }
    }

    struct Broken;

    impl System for Broken {
        fn name(&self) -> &str {
            "Broken"
        }

        fn schedule<'a>(
            &'a self,
            _frame: &Frame,
            _tasks: &mut TaskContext<'a>,
            _after: TaskHandle,
        ) -> anyhow::Result<TaskHandle> {
            anyhow::bail!("cannot schedule")
        }
    }

    struct Faulty;

    impl System for Faulty {
        fn name(&self) -> &str {
            "Faulty"
        }

        fn update(&self, _frame: &mut Frame) -> anyhow::Result<()> {
            anyhow::bail!("update failed")
        }
    }

    fn setup() -> SystemSetup {
        SystemSetup::new()
            .with(SystemDescriptor::new(Broken))
            .with(SystemDescriptor::new(Walk))
    }

    fn join() -> TickInputs {
        TickInputs::new(0).with_join(PlayerJoin {
            player: 0,
            actor_id: 1,
            data: vec![],
        })
    }

    #[test]
    fn test_tick_advances_number() {
        let context = test_context_with(setup());
        let mut frame = context.create_frame().unwrap();
        context.systems().initialize(&mut frame);

        simulate(&mut frame, &join()).unwrap();
        assert_eq!(frame.number(), 0);
        assert_eq!(frame.players().len(), 1);

        let err = simulate(&mut frame, &TickInputs::new(5)).unwrap_err();
        assert_eq!(err, FrameError::TickMismatch { expected: 1, got: 5 });
    }

    #[test]
    fn test_schedule_failure_skips_only_that_system() {
        let context = test_context_with(setup());
        let mut frame = context.create_frame().unwrap();
        context.systems().initialize(&mut frame);
        simulate(&mut frame, &join()).unwrap();

        let result = simulate(&mut frame, &TickInputs::new(1).with_input(0, Step(3).encode())).unwrap();
        assert_eq!(result.failed_tasks, 0);
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].downcast::<Moved>().unwrap().to, 3);
    }

    #[test]
    fn test_update_failure_does_not_skip_later_systems() {
        let setup = SystemSetup::new()
            .with(SystemDescriptor::new(Faulty))
            .with(SystemDescriptor::new(Walk));
        let context = test_context_with(setup);
        let mut frame = context.create_frame().unwrap();
        context.systems().initialize(&mut frame);
        simulate(&mut frame, &join()).unwrap();

        let result = simulate(&mut frame, &TickInputs::new(1).with_input(0, Step(3).encode())).unwrap();
        assert_eq!(result.failed_tasks, 1);
        assert_eq!(result.events.len(), 1);
        let entity = frame.entities_with::<Position>()[0];
        assert_eq!(frame.get::<Position>(entity).unwrap(), Position(3));
    }

    #[test]
    fn test_tick_determinism() {
        let context = test_context_with(setup());
        let mut serializer = FrameSerializer::new();

        let mut run = || {
            let mut frame = context.create_frame().unwrap();
            frame.initialize_globals();
            context.systems().initialize(&mut frame);
            simulate(&mut frame, &join()).unwrap();
            for tick in 1..20 {
                let step = Step((tick % 3) as i8 - 1);
                simulate(&mut frame, &TickInputs::new(tick).with_input(0, step.encode())).unwrap();
            }
            serializer.checksum(&mut frame).unwrap()
        };

        assert_eq!(run(), run());
    }
}
