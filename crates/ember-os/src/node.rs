use embedded_io::Write;

use tracing::{debug, info, warn};

use ember::clock::Clock;
use ember::command::Command;
use ember::config::{MAX_TASKS, Settings, TaskIndex};
use ember::memory::{AllocationCounter, FreeMemory, MemoryGuard};
use ember::plugin::PluginRegistry;
use ember::report::stream_values_json;
use ember::scheduler::{PassSummary, Scheduler};
use ember::stream::{StreamOutcome, StreamingOutput};
use ember::transport::{ChunkedWire, ContentKind, Transport};

use ember_drivers::bus::{I2cAccess, SpiAccess};

use crate::clock::HostClock;
use crate::error::Result;
use crate::http::{Method, Request};

/// Node settings which are not part of the task configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeConfig {
    /// Memory budget shared by task states and response streams, in bytes.
    pub memory_budget: usize,
    /// Time between two scheduler passes, in milliseconds.
    pub tick_interval_ms: u64,
    /// Maximum time a single socket write may take, in milliseconds.
    pub write_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeConfig {
    /// Creates a [`NodeConfig`] with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            memory_budget: 64 * 1024,
            tick_interval_ms: 10,
            write_timeout_ms: 1000,
        }
    }

    /// Sets the memory budget.
    #[must_use]
    pub const fn memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    /// Sets the time between two scheduler passes.
    #[must_use]
    pub const fn tick_interval(mut self, ms: u64) -> Self {
        self.tick_interval_ms = ms;
        self
    }
}

/// The outcome of an out-of-band command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The command was applied by the task in the given slot.
    Applied(TaskIndex),
    /// No task accepted the command.
    Rejected,
    /// The command line is empty.
    Malformed,
}

enum Page {
    Index,
    Values,
    Text(u16, &'static str),
}

/// An `ember` node.
///
/// Owns the scheduler together with the settings store, and answers
/// requests through the bounded streaming output.
pub struct Node<H> {
    scheduler: Scheduler<H>,
    settings: Settings,
    guard: MemoryGuard<AllocationCounter>,
    clock: HostClock,
    config: NodeConfig,
}

impl<H> Node<H>
where
    H: I2cAccess + SpiAccess,
{
    /// Creates a [`Node`] running every available plugin.
    ///
    /// # Errors
    ///
    /// Fails when the plugins cannot be registered.
    pub fn new(hardware: H, settings: Settings, config: NodeConfig) -> Result<Self> {
        let mut registry = PluginRegistry::new();
        ember_drivers::register_all(&mut registry)?;
        info!(
            "{} plugins registered, {} tasks configured",
            registry.len(),
            settings.tasks().count()
        );

        let counter = AllocationCounter::new(config.memory_budget);
        let scheduler =
            Scheduler::new(hardware, registry, *settings.runtime()).with_counter(counter.clone());

        Ok(Self {
            scheduler,
            settings,
            guard: MemoryGuard::new(counter),
            clock: HostClock::new(),
            config,
        })
    }
}

impl<H> Node<H> {
    /// Returns the node settings.
    #[must_use]
    #[inline]
    pub const fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Returns the task settings.
    #[must_use]
    #[inline]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns the task settings mutably.
    ///
    /// Changes are picked up by the next scheduler pass.
    #[inline]
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Returns the scheduler.
    #[must_use]
    #[inline]
    pub const fn scheduler(&self) -> &Scheduler<H> {
        &self.scheduler
    }

    /// Returns the hardware driven by the tasks.
    #[inline]
    pub fn hardware_mut(&mut self) -> &mut H {
        self.scheduler.hardware_mut()
    }

    /// Returns the number of free bytes of the memory budget.
    #[must_use]
    pub fn free_memory(&self) -> usize {
        self.guard.gauge().free_bytes()
    }

    /// Runs one scheduler pass at the current time.
    pub fn tick(&mut self) -> PassSummary {
        let now_ms = self.clock.now_ms();
        self.tick_at(now_ms)
    }

    /// Runs one scheduler pass at the given time.
    pub fn tick_at(&mut self, now_ms: u64) -> PassSummary {
        let summary = self.scheduler.tick(now_ms, &self.settings);

        for slot in summary.updated() {
            if let Some(values) = self.scheduler.values(slot) {
                debug!(slot, values = ?values.as_slice(), "Task values updated");
            }
        }

        summary
    }

    /// Delivers a command line to a task.
    ///
    /// Without a slot, the command is offered to every task in slot order
    /// until one accepts it.
    pub fn command(&mut self, line: &str, slot: Option<TaskIndex>) -> CommandOutcome {
        let Some(command) = Command::parse(line) else {
            return CommandOutcome::Malformed;
        };
        let now_ms = self.clock.now_ms();

        let applied = match slot {
            Some(slot) => self
                .scheduler
                .write(now_ms, slot, &command, &self.settings)
                .then_some(slot),
            None => (0..MAX_TASKS)
                .find(|&slot| self.scheduler.write(now_ms, slot, &command, &self.settings)),
        };

        match applied {
            Some(slot) => {
                info!("Task {slot}: command `{line}` applied");
                CommandOutcome::Applied(slot)
            }
            None => {
                warn!("Command `{line}` rejected");
                CommandOutcome::Rejected
            }
        }
    }

    /// Answers a request, streaming the response into `writer`.
    pub fn respond<W: Write>(&mut self, request: &Request, writer: W) -> StreamOutcome {
        let page = self.route(request);

        let mut wire = ChunkedWire::new(writer);
        let mut output = StreamingOutput::new(
            &mut wire,
            &mut self.guard,
            self.clock,
            self.settings.runtime().stream,
        );

        let outcome = match page {
            Page::Index => render_index(&mut output, &self.scheduler, &self.settings),
            Page::Values => stream_values_json(&mut output, &self.scheduler, &self.settings),
            Page::Text(status, body) => render_text(&mut output, status, body),
        };

        debug!(path = request.path(), ?outcome, "Request served");
        outcome
    }

    /// Answers a request which could not be parsed.
    pub fn reject<W: Write>(&mut self, writer: W) -> StreamOutcome {
        let mut wire = ChunkedWire::new(writer);
        let mut output = StreamingOutput::new(
            &mut wire,
            &mut self.guard,
            self.clock,
            self.settings.runtime().stream,
        );
        render_text(&mut output, 400, "Bad request")
    }

    /// Exits every task.
    pub fn shutdown(&mut self) {
        self.scheduler.shutdown(self.clock.now_ms());
        info!("All tasks stopped");
    }

    fn route(&mut self, request: &Request) -> Page {
        if request.method() != Method::Get {
            return Page::Text(405, "Method not allowed");
        }

        match request.path() {
            "/" => Page::Index,
            "/json" => Page::Values,
            "/control" => {
                let slot = match request.query("task").map(str::parse::<TaskIndex>) {
                    None => None,
                    Some(Ok(slot)) => Some(slot),
                    Some(Err(_)) => return Page::Text(400, "Invalid task"),
                };
                let Some(line) = request.query("cmd") else {
                    return Page::Text(400, "Missing command");
                };

                match self.command(line, slot) {
                    CommandOutcome::Applied(_) => Page::Text(200, "OK"),
                    CommandOutcome::Rejected => Page::Text(400, "Unknown or rejected command"),
                    CommandOutcome::Malformed => Page::Text(400, "Missing command"),
                }
            }
            _ => Page::Text(404, "Not found"),
        }
    }
}

fn render_text<T, M, C>(
    output: &mut StreamingOutput<'_, T, M, C>,
    status: u16,
    body: &'static str,
) -> StreamOutcome
where
    T: Transport,
    M: FreeMemory,
    C: Clock,
{
    output.start(ContentKind::PlainText, false, status, false);
    output.push_static(body);
    output.end()
}

fn push_escaped<T, M, C>(output: &mut StreamingOutput<'_, T, M, C>, text: &str)
where
    T: Transport,
    M: FreeMemory,
    C: Clock,
{
    for c in text.chars() {
        match c {
            '<' => output.push_static("&lt;"),
            '>' => output.push_static("&gt;"),
            '&' => output.push_static("&amp;"),
            '"' => output.push_static("&quot;"),
            _ => output.push_char(c),
        }
    }
}

fn render_index<H, T, M, C>(
    output: &mut StreamingOutput<'_, T, M, C>,
    scheduler: &Scheduler<H>,
    settings: &Settings,
) -> StreamOutcome
where
    T: Transport,
    M: FreeMemory,
    C: Clock,
{
    output.start(ContentKind::Html, false, 200, false);
    output.push_static(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>ember</title></head>\
         <body><table><tr><th>Task</th><th>Name</th><th>Driver</th><th>Values</th></tr>",
    );

    for config in settings.tasks() {
        output.push_static("<tr><td>");
        output.push_display(&config.slot);
        output.push_static("</td><td>");
        push_escaped(output, &config.name);
        output.push_static("</td><td>");
        output.push_display(&config.driver);
        output.push_static("</td><td>");

        if !config.enabled {
            output.push_static("disabled");
        } else if let (Some(values), Some(names)) =
            (scheduler.values(config.slot), scheduler.value_names(config.slot))
        {
            for (index, (name, value)) in names.iter().copied().zip(values.iter()).enumerate() {
                if index > 0 {
                    output.push_static("<br>");
                }
                output.push_static(name);
                output.push_static(": ");
                output.push_float(value);
            }
        }

        output.push_static("</td></tr>");
    }

    output.push_static("</table></body></html>");
    output.end()
}

#[cfg(test)]
mod tests {
    use ember::config::{DriverId, Settings, TaskConfig};
    use ember::stream::StreamOutcome;

    use serde_json::{Value, json};

    use crate::http::Request;
    use crate::sim::HostBoard;

    use super::{CommandOutcome, Node, NodeConfig};

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings
            .set_task(
                TaskConfig::new(0, DriverId(105), "Climate <indoor>")
                    .params(json!({ "device": "aht20" })),
            )
            .unwrap();
        settings
            .set_task(TaskConfig::new(1, DriverId(38), "Strip").params(json!({ "led_count": 2 })))
            .unwrap();
        settings
    }

    fn running_node(config: NodeConfig) -> Node<HostBoard> {
        let mut node = Node::new(HostBoard::new(), settings(), config).unwrap();
        for now in (0..100).step_by(10) {
            let _ = node.tick_at(now);
        }
        node
    }

    // Splits a response into its head and its decoded body.
    fn get(node: &mut Node<HostBoard>, target: &str) -> (String, String) {
        let request = Request::parse(format!("GET {target} HTTP/1.1\r\n\r\n").as_bytes())
            .unwrap()
            .unwrap();
        let mut raw: Vec<u8> = Vec::new();
        let _ = node.respond(&request, &mut raw);

        let text = String::from_utf8(raw).unwrap();
        let (head, mut rest) = text.split_once("\r\n\r\n").unwrap();

        if !head.contains("Transfer-Encoding: chunked") {
            return (head.to_string(), rest.to_string());
        }

        let mut body = String::new();
        loop {
            let (size, tail) = rest.split_once("\r\n").unwrap();
            let size = usize::from_str_radix(size, 16).unwrap();
            if size == 0 {
                break;
            }
            body.push_str(&tail[..size]);
            rest = &tail[size + 2..];
        }
        (head.to_string(), body)
    }

    #[test]
    fn test_values_document() {
        let mut node = running_node(NodeConfig::new());
        assert!(node.scheduler().hardware().sensor.measurements() > 0);

        let (head, body) = get(&mut node, "/json");
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: application/json"));
        assert!(head.contains("Access-Control-Allow-Origin: *"));

        let document: Value = serde_json::from_str(&body).unwrap();
        let tasks = document["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0]["name"], "Climate <indoor>");
        assert_eq!(tasks[0]["driver"], 105);

        let temperature = tasks[0]["values"]["Temperature"].as_f64().unwrap();
        let humidity = tasks[0]["values"]["Humidity"].as_f64().unwrap();
        assert!((temperature - 21.5).abs() < 0.01);
        assert!((humidity - 45.).abs() < 0.01);

        assert_eq!(tasks[1]["values"], json!({}));
    }

    #[test]
    fn test_index_page() {
        let mut node = running_node(NodeConfig::new());

        let (head, body) = get(&mut node, "/");
        assert!(head.contains("Content-Type: text/html"));
        assert!(head.contains("Cache-Control: no-cache"));
        assert!(body.starts_with("<!DOCTYPE html>"));
        assert!(body.ends_with("</html>"));
        assert!(body.contains("<td>Climate &lt;indoor&gt;</td><td>P105</td>"));
        assert!(body.contains("Temperature: 21.50<br>Humidity: 45.00"));
    }

    #[test]
    fn test_control() {
        let mut node = running_node(NodeConfig::new());

        let (head, body) = get(&mut node, "/control?cmd=neopixelall%2C255%2C0%2C0");
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, "OK");
        // Green, red, blue for both LEDs.
        assert_eq!(
            node.scheduler().hardware().strip.colors(),
            [0, 255, 0, 0, 255, 0]
        );

        let (head, body) = get(&mut node, "/control?cmd=neopixel,2,0,0,255&task=1");
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, "OK");
        assert_eq!(
            node.scheduler().hardware().strip.colors(),
            [0, 255, 0, 0, 0, 255]
        );

        let (head, body) = get(&mut node, "/control?cmd=neopixel,1,0,0,255&task=0");
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(body, "Unknown or rejected command");

        let (head, _) = get(&mut node, "/control?cmd=reboot");
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));

        let (_, body) = get(&mut node, "/control?task=x&cmd=reboot");
        assert_eq!(body, "Invalid task");

        let (_, body) = get(&mut node, "/control");
        assert_eq!(body, "Missing command");

        assert_eq!(node.command("", None), CommandOutcome::Malformed);
        assert_eq!(
            node.command("NeoPixelBright,10", None),
            CommandOutcome::Applied(1)
        );
    }

    #[test]
    fn test_unknown_routes() {
        let mut node = running_node(NodeConfig::new());

        let (head, body) = get(&mut node, "/setup");
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(body, "Not found");

        let request = Request::parse(b"DELETE /json HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        let mut raw: Vec<u8> = Vec::new();
        let outcome = node.respond(&request, &mut raw);
        assert!(matches!(outcome, StreamOutcome::Completed(_)));
        assert!(String::from_utf8(raw).unwrap().starts_with("HTTP/1.1 405"));

        let mut raw: Vec<u8> = Vec::new();
        let _ = node.reject(&mut raw);
        assert!(String::from_utf8(raw).unwrap().starts_with("HTTP/1.1 400"));
    }

    #[test]
    fn test_low_memory() {
        let mut node = running_node(NodeConfig::new().memory_budget(2000));
        assert!(node.free_memory() < 2000);

        let (head, body) = get(&mut node, "/json");
        assert!(head.contains("Content-Length:"));
        assert!(body.starts_with("Low memory"));
    }

    #[test]
    fn test_stalled_sensor_recovers() {
        let mut settings = Settings::default();
        settings
            .set_task(TaskConfig::new(0, DriverId(105), "Climate").interval(500))
            .unwrap();
        let mut node = Node::new(HostBoard::new(), settings, NodeConfig::new()).unwrap();
        for now in (0..100).step_by(10) {
            let _ = node.tick_at(now);
        }
        assert_eq!(node.scheduler().stats(0).unwrap().init_ok, 1);

        node.hardware_mut().sensor.stall();
        node.hardware_mut().sensor.set_climate(30., 60.);
        let measurements = node.scheduler().hardware().sensor.measurements();

        // Busy until the dwell limit runs out, old values stay published.
        for now in (100..1000).step_by(10) {
            let _ = node.tick_at(now);
        }
        assert_eq!(node.scheduler().hardware().sensor.measurements(), measurements);
        assert_eq!(node.scheduler().stats(0).unwrap().resets, 0);
        let values = node.scheduler().values(0).unwrap();
        assert!((values.get(0).unwrap() - 21.5).abs() < 0.01);

        for now in (1000..3000).step_by(10) {
            let _ = node.tick_at(now);
        }
        let stats = node.scheduler().stats(0).unwrap();
        assert_eq!(stats.resets, 1);
        assert_eq!(stats.init_ok, 2);
        assert!(node.scheduler().is_initialized(0));
        assert!(node.scheduler().hardware().sensor.measurements() > measurements);

        let values = node.scheduler().values(0).unwrap();
        assert!((values.get(0).unwrap() - 30.).abs() < 0.01);
        assert!((values.get(1).unwrap() - 60.).abs() < 0.01);
    }

    #[test]
    fn test_disable_task() {
        let mut node = running_node(NodeConfig::new());
        let frames = node.scheduler().hardware().strip.frames();

        assert!(node.settings_mut().set_enabled(1, false));
        let _ = node.tick_at(100);

        // The strip is blanked on exit.
        assert_eq!(node.scheduler().hardware().strip.frames(), frames + 1);
        assert_eq!(node.command("neopixelall,1,1,1", None), CommandOutcome::Rejected);

        let (_, body) = get(&mut node, "/json");
        let document: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(document["tasks"].as_array().unwrap().len(), 1);

        let (_, body) = get(&mut node, "/");
        assert!(body.contains("<td>Strip</td><td>P038</td><td>disabled</td>"));

        node.shutdown();
        assert!(!node.scheduler().is_initialized(0));
    }
}
