use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};

use anyhow::Result;

use crate::catalog::Resolver;

/// Print the resolver catalog as a formatted table.
pub fn print_catalog(resolvers: &[Resolver]) {
	let mut table = Table::new();
	table.load_preset(UTF8_FULL);
	table.set_content_arrangement(ContentArrangement::Dynamic);
	table.set_header(vec!["ID", "Name", "Category", "Primary", "Secondary", "Last avg"]);

	for r in resolvers {
		let last = match &r.last_result {
			Some(t) if t.success => format!("{} ms", t.avg_ms()),
			Some(_) => "failed".to_string(),
			None => "-".to_string(),
		};
		table.add_row(vec![
			r.id.to_string(),
			r.name.clone(),
			r.category.label().to_string(),
			r.primary.to_string(),
			r.secondary.to_string(),
			last,
		]);
	}

	println!("{table}");
}

/// Print test results for every resolver that has one attached.
///
/// `best_id` marks the winning row when a ranking run selected one.
pub fn print_results(resolvers: &[Resolver], best_id: Option<u32>) {
	let mut table = Table::new();
	table.load_preset(UTF8_FULL);
	table.set_content_arrangement(ContentArrangement::Dynamic);
	table.set_header(vec![
		"Name", "Avg", "Min", "Max", "Loss", "Quality", "Stability", "",
	]);

	for r in resolvers {
		let Some(t) = &r.last_result else {
			continue;
		};
		let marker = if best_id == Some(r.id) { "best" } else { "" };
		if t.success {
			table.add_row(vec![
				r.name.clone(),
				format!("{} ms", t.avg_ms()),
				format!("{} ms", t.min.as_millis()),
				format!("{} ms", t.max.as_millis()),
				format!("{:.0}%", t.loss_pct),
				t.quality().label().to_string(),
				format!("{}/100", t.stability_score()),
				marker.to_string(),
			]);
		} else {
			table.add_row(vec![
				r.name.clone(),
				"-".to_string(),
				"-".to_string(),
				"-".to_string(),
				"100%".to_string(),
				t.quality().label().to_string(),
				"0/100".to_string(),
				marker.to_string(),
			]);
		}
	}

	println!("{table}");
}

/// Write attached test results to a CSV file.
pub fn write_csv(path: &str, resolvers: &[Resolver]) -> Result<()> {
	let mut writer = csv::Writer::from_path(path)?;

	writer.write_record([
		"id", "name", "primary", "secondary",
		"avg_ms", "min_ms", "max_ms", "loss_pct",
		"success", "samples", "quality", "stability",
	])?;

	for r in resolvers {
		let Some(t) = &r.last_result else {
			continue;
		};
		writer.write_record([
			r.id.to_string(),
			r.name.clone(),
			r.primary.to_string(),
			r.secondary.to_string(),
			t.avg_ms().to_string(),
			t.min.as_millis().to_string(),
			t.max.as_millis().to_string(),
			format!("{:.1}", t.loss_pct),
			t.success.to_string(),
			t.sample_count.to_string(),
			t.quality().label().to_string(),
			t.stability_score().to_string(),
		])?;
	}

	writer.flush()?;
	println!("Results written to: {}", path);
	Ok(())
}
