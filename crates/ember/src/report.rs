use hashbrown::DefaultHashBuilder;
use indexmap::IndexMap;

use log::error;

use serde::Serialize;

use crate::clock::Clock;
use crate::config::{DriverId, MAX_TASKS, TaskIndex, TaskTable};
use crate::memory::FreeMemory;
use crate::scheduler::Scheduler;
use crate::stream::{StreamOutcome, StreamingOutput};
use crate::transport::Transport;

#[derive(Serialize)]
struct TaskReport<'a> {
    slot: TaskIndex,
    name: &'a str,
    driver: DriverId,
    values: IndexMap<&'static str, f32, DefaultHashBuilder>,
}

/// Renders the values of all enabled tasks as a JSON document.
///
/// ```json
/// {"tasks":[{"slot":0,"name":"Climate","driver":105,"values":{"Temperature":21.77,"Humidity":45.23}}]}
/// ```
///
/// Each task is serialized on its own, so the memory used at any time is
/// bounded by the largest task entry plus the stream capacity.
/// Tasks without a live instance are skipped.
pub fn render_values_json<H, T, M, C, Tb>(
    output: &mut StreamingOutput<'_, T, M, C>,
    scheduler: &Scheduler<H>,
    table: &Tb,
) where
    T: Transport,
    M: FreeMemory,
    C: Clock,
    Tb: TaskTable + ?Sized,
{
    output.push_static("{\"tasks\":[");

    let mut first = true;
    for slot in 0..MAX_TASKS {
        let Some(config) = table.task(slot).filter(|config| config.enabled) else {
            continue;
        };
        let (Some(values), Some(names)) = (scheduler.values(slot), scheduler.value_names(slot))
        else {
            continue;
        };

        let report = TaskReport {
            slot,
            name: &config.name,
            driver: config.driver,
            values: names.iter().copied().zip(values.iter()).collect(),
        };

        match serde_json::to_vec(&report) {
            Ok(entry) => {
                if !first {
                    output.push_char(',');
                }
                first = false;
                output.append(&entry);
            }
            Err(e) => error!("Task {slot}: values not serialized: {e}"),
        }
    }

    output.push_static("]}");
}

/// Streams the values of all enabled tasks as a complete JSON response.
pub fn stream_values_json<H, T, M, C, Tb>(
    output: &mut StreamingOutput<'_, T, M, C>,
    scheduler: &Scheduler<H>,
    table: &Tb,
) -> StreamOutcome
where
    T: Transport,
    M: FreeMemory,
    C: Clock,
    Tb: TaskTable + ?Sized,
{
    output.start_json();
    render_values_json(output, scheduler, table);
    output.end()
}
