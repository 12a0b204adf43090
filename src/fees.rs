use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};

/// Declarative fee plan template. The wire shape is discriminated by `type`
/// with the template-specific numeric parameters alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlanTemplate {
    #[serde(rename = "monthly", rename_all = "camelCase")]
    Monthly {
        monthly_amount: f64,
        total_months: u32,
    },
    #[serde(rename = "quarterly", rename_all = "camelCase")]
    Quarterly {
        quarterly_amount: f64,
        total_quarters: u32,
    },
    #[serde(rename = "semi-annually", rename_all = "camelCase")]
    SemiAnnually {
        semi_annual_amount: f64,
        total_installments: u32,
    },
    #[serde(rename = "annually", rename_all = "camelCase")]
    Annually {
        total_amount: f64,
        #[serde(default)]
        discount: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallmentDef {
    pub description: String,
    pub amount: f64,
    pub offset_months: u32,
}

/// Expand a plan template into its ordered installment descriptors.
///
/// Total function: no clamping or sign checks happen here. Template
/// validation is the caller's concern (`validate_plan`).
pub fn generate_installments(plan: &PlanTemplate) -> Vec<InstallmentDef> {
    match plan {
        PlanTemplate::Monthly {
            monthly_amount,
            total_months,
        } => (0..*total_months)
            .map(|i| InstallmentDef {
                description: format!("Month {}", i + 1),
                amount: *monthly_amount,
                offset_months: i,
            })
            .collect(),
        PlanTemplate::Quarterly {
            quarterly_amount,
            total_quarters,
        } => (0..*total_quarters)
            .map(|i| InstallmentDef {
                description: format!("Quarter {}", i + 1),
                amount: *quarterly_amount,
                offset_months: i * 3,
            })
            .collect(),
        PlanTemplate::SemiAnnually {
            semi_annual_amount,
            total_installments,
        } => (0..*total_installments)
            .map(|i| InstallmentDef {
                description: format!("Installment {}", i + 1),
                amount: *semi_annual_amount,
                offset_months: i * 6,
            })
            .collect(),
        PlanTemplate::Annually {
            total_amount,
            discount,
        } => vec![InstallmentDef {
            description: "Annual fee".to_string(),
            amount: total_amount - discount,
            offset_months: 0,
        }],
    }
}

/// Template sanity checks applied when a plan is authored.
pub fn validate_plan(plan: &PlanTemplate) -> Result<(), String> {
    match plan {
        PlanTemplate::Monthly {
            monthly_amount,
            total_months,
        } => {
            if *total_months == 0 {
                return Err("totalMonths must be at least 1".to_string());
            }
            if *monthly_amount <= 0.0 {
                return Err("monthlyAmount must be positive".to_string());
            }
        }
        PlanTemplate::Quarterly {
            quarterly_amount,
            total_quarters,
        } => {
            if *total_quarters == 0 {
                return Err("totalQuarters must be at least 1".to_string());
            }
            if *quarterly_amount <= 0.0 {
                return Err("quarterlyAmount must be positive".to_string());
            }
        }
        PlanTemplate::SemiAnnually {
            semi_annual_amount,
            total_installments,
        } => {
            if *total_installments == 0 {
                return Err("totalInstallments must be at least 1".to_string());
            }
            if *semi_annual_amount <= 0.0 {
                return Err("semiAnnualAmount must be positive".to_string());
            }
        }
        PlanTemplate::Annually {
            total_amount,
            discount,
        } => {
            if *total_amount <= 0.0 {
                return Err("totalAmount must be positive".to_string());
            }
            if *discount < 0.0 {
                return Err("discount must not be negative".to_string());
            }
            if discount > total_amount {
                return Err("discount must not exceed totalAmount".to_string());
            }
        }
    }
    Ok(())
}

/// Resolve an installment offset against a student's admission date.
/// Day-of-month is preserved, clamped to the end of shorter months.
pub fn resolve_due_date(admission: NaiveDate, offset_months: u32) -> NaiveDate {
    admission
        .checked_add_months(Months::new(offset_months))
        .unwrap_or(admission)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date literal")
    }

    #[test]
    fn monthly_expands_one_entry_per_month() {
        let plan = PlanTemplate::Monthly {
            monthly_amount: 2500.0,
            total_months: 11,
        };
        let out = generate_installments(&plan);
        assert_eq!(out.len(), 11);
        for (i, inst) in out.iter().enumerate() {
            assert_eq!(inst.offset_months, i as u32);
            assert_eq!(inst.amount, 2500.0);
        }
        assert_eq!(out[0].description, "Month 1");
        assert_eq!(out[10].description, "Month 11");
    }

    #[test]
    fn quarterly_offsets_step_by_three() {
        let plan = PlanTemplate::Quarterly {
            quarterly_amount: 6000.0,
            total_quarters: 4,
        };
        let offsets: Vec<u32> = generate_installments(&plan)
            .iter()
            .map(|i| i.offset_months)
            .collect();
        assert_eq!(offsets, vec![0, 3, 6, 9]);
    }

    #[test]
    fn semi_annual_offsets_step_by_six() {
        let plan = PlanTemplate::SemiAnnually {
            semi_annual_amount: 11000.0,
            total_installments: 3,
        };
        let offsets: Vec<u32> = generate_installments(&plan)
            .iter()
            .map(|i| i.offset_months)
            .collect();
        assert_eq!(offsets, vec![0, 6, 12]);
    }

    #[test]
    fn annual_subtracts_discount() {
        let plan = PlanTemplate::Annually {
            total_amount: 24000.0,
            discount: 1500.0,
        };
        let out = generate_installments(&plan);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].amount, 22500.0);
        assert_eq!(out[0].offset_months, 0);
    }

    #[test]
    fn annual_discount_defaults_to_zero_on_the_wire() {
        let plan: PlanTemplate =
            serde_json::from_value(serde_json::json!({ "type": "annually", "totalAmount": 18000.0 }))
                .expect("parse plan");
        let out = generate_installments(&plan);
        assert_eq!(out[0].amount, 18000.0);
    }

    #[test]
    fn generator_does_not_clamp_oversized_discount() {
        // Authoring-time validation rejects this; the generator stays total.
        let plan = PlanTemplate::Annually {
            total_amount: 1000.0,
            discount: 1500.0,
        };
        assert_eq!(generate_installments(&plan)[0].amount, -500.0);
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn due_date_adds_calendar_months() {
        assert_eq!(
            resolve_due_date(date("2024-01-15"), 3),
            date("2024-04-15")
        );
        assert_eq!(resolve_due_date(date("2024-01-15"), 0), date("2024-01-15"));
    }

    #[test]
    fn due_date_clamps_to_month_end() {
        assert_eq!(resolve_due_date(date("2024-01-31"), 1), date("2024-02-29"));
        assert_eq!(resolve_due_date(date("2023-08-31"), 1), date("2023-09-30"));
    }

    #[test]
    fn validate_rejects_zero_counts() {
        assert!(validate_plan(&PlanTemplate::Monthly {
            monthly_amount: 2500.0,
            total_months: 0,
        })
        .is_err());
    }
}
