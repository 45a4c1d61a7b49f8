//! Plots of the training history
//!
//! By convention training curves are plotted in blue and validation curves in red.

use std::error::Error;

use plotters::{
    chart::{ChartBuilder, SeriesLabelPosition},
    prelude::{BitMapBackend, IntoDrawingArea, LineSeries, PathElement},
    style::{BLACK, BLUE, Color, RED, WHITE},
};

use crate::train::TrainingHistory;

/// Plots the training and test loss of every epoch
pub fn plot_losses(history: &TrainingHistory, file_name: &str) -> Result<(), Box<dyn Error>> {
    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let n_epochs = history.train_losses.len().max(1);
    let max_loss = history
        .train_losses
        .iter()
        .chain(history.test_losses.iter())
        .copied()
        .filter(|l| l.is_finite())
        .fold(0.0f32, f32::max)
        .max(f32::EPSILON);

    let mut chart = ChartBuilder::on(&root_area)
        .caption("Loss per epoch", ("sans-serif", 40))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(1usize..n_epochs + 1, 0.0f32..max_loss * 1.1)?;

    chart
        .configure_mesh()
        .x_desc("epoch")
        .y_desc("loss")
        .draw()?;

    chart
        .draw_series(LineSeries::new(
            history
                .train_losses
                .iter()
                .enumerate()
                .map(|(i, &l)| (i + 1, l)),
            &BLUE,
        ))?
        .label("Training loss")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));

    chart
        .draw_series(LineSeries::new(
            history
                .test_losses
                .iter()
                .enumerate()
                .map(|(i, &l)| (i + 1, l)),
            &RED,
        ))?
        .label("Validation loss")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root_area.present()?;
    log::info!("Loss plot saved to '{}'.", file_name);
    Ok(())
}
