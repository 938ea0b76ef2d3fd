//! RTT-per-hop line chart, rendered off-screen and saved as text.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Rect},
    style::{Color, Style},
    symbols,
    text::Span,
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, LegendPosition, Widget},
};
use tracing::debug;

use crate::hop::TraceResult;

pub const CHART_WIDTH: u16 = 100;
pub const CHART_HEIGHT: u16 = 30;

/// Mean line points per hop; sparse enough to read as a dashed line
const MEAN_POINTS_PER_HOP: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChartOutcome {
    Written(PathBuf),
    /// No hop produced an RTT
    Skipped,
}

/// Render the chart into a `width` x `height` text block.
///
/// Returns `None` when the result has no measured RTTs.
pub fn render_rtt_chart(result: &TraceResult, width: u16, height: u16) -> Option<String> {
    let points: Vec<(f64, f64)> = result
        .rtt_series()
        .into_iter()
        .filter_map(|(ttl, rtt)| rtt.map(|rtt| (f64::from(ttl), rtt)))
        .collect();
    let mean = result.mean_rtt_ms()?;

    let last_hop = result.hops().last().map_or(1, |hop| hop.ttl).max(2);
    let x_max = f64::from(last_hop);
    let max_rtt = points.iter().map(|(_, rtt)| *rtt).fold(0.0, f64::max);
    let y_max = if max_rtt > 0.0 { max_rtt * 1.1 } else { 1.0 };

    let mean_points: Vec<(f64, f64)> = (0..=(last_hop as usize - 1) * MEAN_POINTS_PER_HOP)
        .map(|i| (1.0 + i as f64 / MEAN_POINTS_PER_HOP as f64, mean))
        .collect();

    let mean_label = format!("mean {:.2} ms", mean);
    let datasets = vec![
        Dataset::default()
            .name("RTT (ms)")
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Green))
            .data(&points),
        Dataset::default()
            .name(mean_label)
            .marker(symbols::Marker::Dot)
            .graph_type(GraphType::Scatter)
            .style(Style::default().fg(Color::Red))
            .data(&mean_points),
    ];

    let chart = Chart::new(datasets)
        .block(
            Block::default()
                .title("Traceroute - RTT per hop")
                .borders(Borders::ALL),
        )
        .x_axis(
            Axis::default()
                .title("Hop")
                .style(Style::default().fg(Color::Gray))
                .bounds([1.0, x_max])
                .labels(vec![
                    Span::raw("1"),
                    Span::raw(format!("{}", (1 + last_hop) / 2)),
                    Span::raw(format!("{}", last_hop)),
                ]),
        )
        .y_axis(
            Axis::default()
                .title("RTT (ms)")
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, y_max])
                .labels(vec![
                    Span::raw("0"),
                    Span::raw(format!("{:.1}", y_max / 2.0)),
                    Span::raw(format!("{:.1}", y_max)),
                ]),
        )
        .legend_position(Some(LegendPosition::TopRight))
        .hidden_legend_constraints((Constraint::Ratio(1, 2), Constraint::Ratio(1, 2)));

    let area = Rect::new(0, 0, width, height);
    let mut buffer = Buffer::empty(area);
    chart.render(area, &mut buffer);
    Some(buffer_to_text(&buffer))
}

fn buffer_to_text(buffer: &Buffer) -> String {
    let area = buffer.area;
    let mut text = String::with_capacity(usize::from(area.width + 1) * usize::from(area.height));
    for y in area.top()..area.bottom() {
        let mut line = String::new();
        for x in area.left()..area.right() {
            line.push_str(buffer[(x, y)].symbol());
        }
        text.push_str(line.trim_end());
        text.push('\n');
    }
    text
}

/// Render and save the chart, or skip it when there is nothing to plot.
pub fn write_rtt_chart(result: &TraceResult, path: &Path) -> io::Result<ChartOutcome> {
    let Some(text) = render_rtt_chart(result, CHART_WIDTH, CHART_HEIGHT) else {
        debug!("no measured hops, chart skipped");
        return Ok(ChartOutcome::Skipped);
    };
    fs::write(path, text)?;
    debug!("chart written to {}", path.display());
    Ok(ChartOutcome::Written(path.to_path_buf()))
}
