//! The dashboard's aggregate catalog.
//!
//! Most panels read from the warehouse star schema; the content and active-user
//! totals come from the operational database.

use pulseboard_core::{CatalogError, QueryCatalog, QuerySpec};

const MONTHLY_VIEWS: &str = "
    SELECT dd.Month, dd.Year, SUM(fcv.ViewCount) AS views
    FROM FactContentViews fcv
    JOIN DimDate dd ON fcv.DateKey = dd.DateKey
    GROUP BY dd.Year, dd.Month
    ORDER BY dd.Year, dd.Month";

// Latest 30 days, presented oldest first.
const LAST_30_DAYS_VIEWS: &str = "
    SELECT Date, views FROM (
        SELECT dd.Date AS Date, SUM(fcv.ViewCount) AS views
        FROM FactContentViews fcv
        JOIN DimDate dd ON fcv.DateKey = dd.DateKey
        GROUP BY dd.Date
        ORDER BY dd.Date DESC
        LIMIT 30
    ) ORDER BY Date ASC";

const TOP_MOVIES: &str = "
    SELECT dc.Title, SUM(fcp.TotalViews) AS views
    FROM FactContentPerformance fcp
    JOIN DimContent dc ON fcp.ContentKey = dc.ContentKey
    WHERE dc.IsCurrent = TRUE
    GROUP BY dc.Title
    ORDER BY views DESC
    LIMIT 10";

const TOP_RATED_MOVIES: &str = "
    SELECT dc.Title, AVG(fcp.AverageRating) AS rating
    FROM FactContentPerformance fcp
    JOIN DimContent dc ON fcp.ContentKey = dc.ContentKey
    WHERE dc.IsCurrent = TRUE
    GROUP BY dc.Title
    ORDER BY rating DESC
    LIMIT 10";

const TOP_LIKED_MOVIES: &str = "
    SELECT dc.Title, SUM(fue.LikeCount) AS likes
    FROM FactUserEngagement fue
    JOIN DimContent dc ON fue.ContentKey = dc.ContentKey
    WHERE fue.EngagementType = 'Like'
    GROUP BY dc.Title
    ORDER BY likes DESC
    LIMIT 10";

const GENRE_VIEWS: &str = "
    SELECT dg.GenreName, SUM(fcp.TotalViews) AS views
    FROM FactContentPerformance fcp
    JOIN DimGenre dg ON fcp.GenreKey = dg.GenreKey
    GROUP BY dg.GenreName
    ORDER BY views DESC";

const RATING_STATS: &str = "
    SELECT ROUND(AverageRating) AS rating_bin, COUNT(*) AS count
    FROM FactContentPerformance
    GROUP BY rating_bin
    ORDER BY rating_bin";

const TOP_USERS: &str = "
    SELECT du.Username, SUM(fcv.ViewCount) AS views
    FROM FactContentViews fcv
    JOIN DimUser du ON fcv.UserKey = du.UserKey
    GROUP BY du.Username
    ORDER BY views DESC
    LIMIT 10";

const AVG_WATCHTIME: &str = "
    SELECT du.Username, ROUND(AVG(fcv.DurationWatched) / 60) AS avg_minutes
    FROM FactContentViews fcv
    JOIN DimUser du ON fcv.UserKey = du.UserKey
    GROUP BY du.Username
    ORDER BY avg_minutes DESC
    LIMIT 10";

const ENGAGEMENT_TYPE: &str = "
    SELECT EngagementType, COUNT(*) AS count
    FROM FactUserEngagement
    GROUP BY EngagementType";

const DEVICE_TYPE: &str = "
    SELECT DeviceType, COUNT(*) AS count
    FROM DimDevice
    GROUP BY DeviceType";

const BROWSERS: &str = "
    SELECT Browser, COUNT(*) AS count
    FROM DimDevice
    WHERE Browser IS NOT NULL
    GROUP BY Browser
    ORDER BY count DESC
    LIMIT 10";

const TIMELINE: &str = "
    SELECT dd.Date,
        SUM(CASE WHEN fue.EngagementType = 'Like' THEN 1 ELSE 0 END) AS likes,
        SUM(CASE WHEN fue.EngagementType = 'Comment' THEN 1 ELSE 0 END) AS comments,
        SUM(CASE WHEN fue.EngagementType = 'Review' THEN 1 ELSE 0 END) AS reviews
    FROM FactUserEngagement fue
    JOIN DimDate dd ON fue.DateKey = dd.DateKey
    GROUP BY dd.Date
    ORDER BY dd.Date";

const HEATMAP: &str = "
    SELECT dd.DayName, dt.Hour, SUM(fua.ActivityCount) AS activity
    FROM FactUserActivity fua
    JOIN DimDate dd ON fua.DateKey = dd.DateKey
    JOIN DimTime dt ON fua.TimeKey = dt.TimeKey
    GROUP BY dd.DayName, dt.Hour
    ORDER BY dd.DayName, dt.Hour";

const TOP_COUNTRIES: &str = "
    SELECT dc.Country, SUM(fcp.TotalViews) AS views
    FROM FactContentPerformance fcp
    JOIN DimContent dc ON fcp.ContentKey = dc.ContentKey
    WHERE dc.Country IS NOT NULL
    GROUP BY dc.Country
    ORDER BY views DESC
    LIMIT 10";

const USER_LOCATION: &str = "
    SELECT City, COUNT(*) AS user_count
    FROM DimLocation
    GROUP BY City
    ORDER BY user_count DESC";

const SUMMARY_CONTENTS: &str = "SELECT COUNT(*) AS count FROM Content";

const SUMMARY_USERS: &str = "SELECT COUNT(*) AS count FROM Users WHERE IsActive = TRUE";

const SUMMARY_VIEWS: &str = "SELECT COALESCE(SUM(ViewCount), 0) AS totalViews FROM FactContentViews";

pub fn dashboard_catalog() -> Result<QueryCatalog, CatalogError> {
    QueryCatalog::new()
        .with(QuerySpec::warehouse("monthlyViews", MONTHLY_VIEWS))?
        .with(QuerySpec::warehouse("last30DaysViews", LAST_30_DAYS_VIEWS))?
        .with(QuerySpec::warehouse("topMovies", TOP_MOVIES))?
        .with(QuerySpec::warehouse("topRatedMovies", TOP_RATED_MOVIES))?
        .with(QuerySpec::warehouse("topLikedMovies", TOP_LIKED_MOVIES))?
        .with(QuerySpec::warehouse("genreViews", GENRE_VIEWS))?
        .with(QuerySpec::warehouse("ratingStats", RATING_STATS))?
        .with(QuerySpec::warehouse("topUsers", TOP_USERS))?
        .with(QuerySpec::warehouse("avgWatchtime", AVG_WATCHTIME))?
        .with(QuerySpec::warehouse("engagementType", ENGAGEMENT_TYPE))?
        .with(QuerySpec::warehouse("deviceType", DEVICE_TYPE))?
        .with(QuerySpec::warehouse("browsers", BROWSERS))?
        .with(QuerySpec::warehouse("timeline", TIMELINE))?
        .with(QuerySpec::warehouse("heatmap", HEATMAP))?
        .with(QuerySpec::warehouse("topCountries", TOP_COUNTRIES))?
        .with(QuerySpec::warehouse("userLocation", USER_LOCATION))?
        .with(QuerySpec::operational("summaryContents", SUMMARY_CONTENTS))?
        .with(QuerySpec::operational("summaryUsers", SUMMARY_USERS))?
        .with(QuerySpec::warehouse("summaryViews", SUMMARY_VIEWS))
}
